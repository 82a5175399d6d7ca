use crate::error::Result;

/// Maps a SMILES string to the key used for compound-level grouping.
///
/// Two records belong to the same compound exactly when their keys are equal.
/// Chemical canonicalization and InChI generation live outside this crate;
/// toolkit bindings plug in through [`FnIdentity`]. Whatever stereochemistry
/// handling a provider implements, callers must hold a single scheme for the
/// whole run: mixing schemes across splits reintroduces leakage.
pub trait CompoundIdentity: Send + Sync {
    fn key(&self, smiles: &str) -> Result<String>;

    fn keys(&self, smiles: &[String]) -> Result<Vec<String>> {
        smiles.iter().map(|s| self.key(s)).collect()
    }

    /// Short name used in log lines.
    fn scheme_name(&self) -> &str;
}

/// Identity by the literal (trimmed) SMILES string. No canonicalization:
/// distinct spellings of one molecule count as distinct compounds.
#[derive(Debug, Clone, Default)]
pub struct RawSmiles;

impl CompoundIdentity for RawSmiles {
    fn key(&self, smiles: &str) -> Result<String> {
        Ok(smiles.trim().to_string())
    }

    fn scheme_name(&self) -> &str {
        "raw"
    }
}

/// Adapter wrapping an external canonicalization or InChI function.
pub struct FnIdentity<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    func: F,
    name: String,
}

impl<F> FnIdentity<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            func,
            name: name.into(),
        }
    }
}

impl<F> CompoundIdentity for FnIdentity<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn key(&self, smiles: &str) -> Result<String> {
        (self.func)(smiles).map(|k| k.trim().to_string())
    }

    fn scheme_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_identity_trims() {
        let id = RawSmiles;
        assert_eq!(id.key(" CCO ").unwrap(), "CCO");
        assert_eq!(id.scheme_name(), "raw");
    }

    #[test]
    fn fn_identity_applies_function() {
        let id = FnIdentity::new("lowercase", |s: &str| Ok(s.to_lowercase()));
        assert_eq!(id.key("CCO").unwrap(), "cco");
        assert_eq!(id.key("cCo").unwrap(), "cco");
    }

    #[test]
    fn keys_preserves_order() {
        let id = RawSmiles;
        let smiles = vec!["CC".to_string(), " C ".to_string()];
        assert_eq!(id.keys(&smiles).unwrap(), vec!["CC", "C"]);
    }
}
