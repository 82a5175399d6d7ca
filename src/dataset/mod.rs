pub mod identity;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::error::{ModelError, Result};
use identity::CompoundIdentity;

/// One measurement: a structure, the retention index measured for it, and the
/// chromatographic column (condition) id it was measured on.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub smiles: String,
    pub retention: f32,
    pub column: i32,
}

impl Record {
    pub fn new(smiles: impl Into<String>, retention: f32, column: i32) -> Self {
        let smiles: String = smiles.into();
        Self {
            smiles: smiles.trim().to_string(),
            retention,
            column,
        }
    }
}

/// How much of a dataset a split should take out.
#[derive(Debug, Clone, Copy)]
pub enum SplitSize {
    Count(usize),
    Fraction(f32),
}

impl SplitSize {
    fn resolve(&self, total: usize) -> usize {
        match *self {
            SplitSize::Count(n) => n.min(total),
            SplitSize::Fraction(f) => ((f * total as f32).round() as usize).min(total),
        }
    }
}

/// Aggregation mode for collapsing repeat measurements of one compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Mean,
    Median,
}

/// Ordered collection of retention records.
///
/// Insertion order carries no meaning but is preserved so file round-trips
/// are reproducible. Duplicate records for one compound are legitimate repeat
/// measurements; nothing here deduplicates silently.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn all_smiles(&self) -> Vec<String> {
        self.records.iter().map(|r| r.smiles.clone()).collect()
    }

    pub fn all_retentions(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.retention).collect()
    }

    pub fn all_columns(&self) -> Vec<i32> {
        self.records.iter().map(|r| r.column).collect()
    }

    /// Shuffle record order in place. Unseeded by default; pass a seed for
    /// reproducible experiments.
    pub fn shuffle(&mut self, seed: Option<u64>) {
        let mut rng = rng_from(seed);
        self.records.shuffle(&mut rng);
    }

    /// Distinct trimmed SMILES strings, without canonicalization. A molecule
    /// written two ways appears twice.
    pub fn compounds(&self) -> HashSet<String> {
        self.records
            .iter()
            .map(|r| r.smiles.trim().to_string())
            .collect()
    }

    /// Distinct compound keys under the given identity scheme.
    pub fn compounds_with(&self, identity: &dyn CompoundIdentity) -> Result<HashSet<String>> {
        self.records
            .iter()
            .map(|r| identity.key(&r.smiles))
            .collect()
    }

    /// Split off every record belonging to a random subset of distinct
    /// compounds. A compound's records never end up on both sides.
    ///
    /// The subset size is counted in compounds, not records. Selection is
    /// non-reproducible unless a seed is supplied.
    pub fn split_by_compounds(&mut self, size: SplitSize, seed: Option<u64>) -> Dataset {
        let mut rng = rng_from(seed);
        let mut compounds: Vec<String> = self.compounds().into_iter().collect();
        compounds.sort_unstable();
        compounds.shuffle(&mut rng);
        let n = size.resolve(compounds.len());
        let selected: HashSet<&String> = compounds.iter().take(n).collect();

        let records = std::mem::take(&mut self.records);
        let mut split = Vec::new();
        for record in records {
            if selected.contains(&record.smiles.trim().to_string()) {
                split.push(record);
            } else {
                self.records.push(record);
            }
        }
        let mut result = Dataset::new(split);
        result.shuffle(seed.map(|s| s.wrapping_add(1)));
        self.shuffle(seed.map(|s| s.wrapping_add(2)));
        result
    }

    /// Record-count split ignoring compound identity: the first `n` records
    /// are moved out. Use only where compound leakage is intended or harmless.
    pub fn simple_split(&mut self, size: SplitSize) -> Dataset {
        let n = size.resolve(self.records.len());
        let rest = self.records.split_off(n);
        let split = std::mem::replace(&mut self.records, rest);
        Dataset::new(split)
    }

    /// Shuffle, then `simple_split`.
    pub fn simple_shuffle_split(&mut self, size: SplitSize, seed: Option<u64>) -> Dataset {
        self.shuffle(seed);
        self.simple_split(size)
    }

    /// Remove from this set every record whose compound (under `identity`)
    /// also occurs in `other`. Guarantees zero overlap afterwards.
    pub fn filter_out_compounds(
        &mut self,
        other: &Dataset,
        identity: &dyn CompoundIdentity,
    ) -> Result<()> {
        let foreign = other.compounds_with(identity)?;
        let records = std::mem::take(&mut self.records);
        for record in records {
            if !foreign.contains(&identity.key(&record.smiles)?) {
                self.records.push(record);
            }
        }
        Ok(())
    }

    /// Number of compounds present in both sets under the given identity.
    pub fn count_identical(
        &self,
        other: &Dataset,
        identity: &dyn CompoundIdentity,
    ) -> Result<usize> {
        let mine = self.compounds_with(identity)?;
        let theirs = other.compounds_with(identity)?;
        Ok(mine.intersection(&theirs).count())
    }

    /// Group records by compound key, preserving first-seen order of groups.
    pub fn group_by_compounds(
        &self,
        identity: &dyn CompoundIdentity,
    ) -> Result<IndexMap<String, Vec<Record>>> {
        let mut groups: IndexMap<String, Vec<Record>> = IndexMap::new();
        for record in &self.records {
            let key = identity.key(&record.smiles)?;
            groups.entry(key).or_default().push(record.clone());
        }
        Ok(groups)
    }

    /// Collapse repeat measurements into one record per compound, taking the
    /// mean or median retention. Compounds with fewer than `min_group_size`
    /// records are dropped. The aggregated record carries column `-1`.
    pub fn aggregate_by_compounds(
        &self,
        identity: &dyn CompoundIdentity,
        mode: Aggregate,
        min_group_size: usize,
    ) -> Result<Dataset> {
        let groups = self.group_by_compounds(identity)?;
        let mut records = Vec::new();
        for (key, members) in groups {
            if members.len() < min_group_size {
                continue;
            }
            let values: Vec<f32> = members.iter().map(|r| r.retention).collect();
            let value = match mode {
                Aggregate::Mean => crate::models::metrics::mean(&values),
                Aggregate::Median => crate::models::metrics::median(&values),
            };
            records.push(Record::new(key, value, -1));
        }
        Ok(Dataset::new(records))
    }

    /// Rewrite every SMILES in place to its key under `identity`. Used to put
    /// a whole experiment onto one canonical form up front.
    pub fn canonicalize_all(&mut self, identity: &dyn CompoundIdentity) -> Result<()> {
        for record in &mut self.records {
            record.smiles = identity.key(&record.smiles)?;
        }
        Ok(())
    }

    /// One record per line: `SMILES retention column`, whitespace separated.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        for record in &self.records {
            writeln!(file, "{} {} {}", record.smiles, record.retention, record.column)?;
        }
        Ok(())
    }

    /// Load a dataset saved by [`Dataset::save_to_file`]. SMILES strings are
    /// taken as-is. Blank lines are skipped; anything else malformed is a
    /// parse error naming the line, surfaced here rather than downstream.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Dataset> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(parse_record_line(&line, lineno + 1)?);
        }
        Ok(Dataset::new(records))
    }

    pub fn merge(sets: &[Dataset]) -> Dataset {
        let mut records = Vec::new();
        for set in sets {
            records.extend_from_slice(&set.records);
        }
        Dataset::new(records)
    }
}

fn parse_record_line(line: &str, lineno: usize) -> Result<Record> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(ModelError::parse(format!(
            "line {lineno}: expected `SMILES retention column`, got {:?}",
            line
        )));
    }
    let retention: f32 = tokens[1]
        .parse()
        .map_err(|_| ModelError::parse(format!("line {lineno}: bad retention {:?}", tokens[1])))?;
    let column: i32 = tokens[2]
        .parse()
        .map_err(|_| ModelError::parse(format!("line {lineno}: bad column {:?}", tokens[2])))?;
    Ok(Record::new(tokens[0], retention, column))
}

pub(crate) fn rng_from(seed: Option<u64>) -> Pcg64 {
    match seed {
        Some(s) => Pcg64::seed_from_u64(s),
        None => Pcg64::from_entropy(),
    }
}
