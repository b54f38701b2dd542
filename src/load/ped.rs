//! Pedigree (PED) file loading and merging with the header samples.

use std::{collections::HashMap, io::BufRead, path::Path};

use serde::{Deserialize, Serialize};

use crate::{common::io::open_read_maybe_gz, err::ConfigError};

/// Sex of an individual as coded in PED files.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
    #[default]
    Unknown,
}

impl Sex {
    fn from_code(code: &str) -> Self {
        match code {
            "1" => Sex::Male,
            "2" => Sex::Female,
            _ => Sex::Unknown,
        }
    }
}

/// Affection status as coded in PED files.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Phenotype {
    Unaffected,
    Affected,
    #[default]
    Unknown,
}

impl Phenotype {
    fn from_code(code: &str) -> Self {
        match code {
            "1" => Phenotype::Unaffected,
            "2" => Phenotype::Affected,
            _ => Phenotype::Unknown,
        }
    }
}

/// One line of a PED file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PedEntry {
    pub family_id: String,
    pub name: String,
    pub paternal_id: Option<String>,
    pub maternal_id: Option<String>,
    pub sex: Sex,
    pub phenotype: Phenotype,
}

/// A sample of the load, in header column order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// 1-based identifier, equal to the header column rank.
    pub sample_id: usize,
    pub name: String,
    pub family_id: Option<String>,
    pub paternal_id: Option<String>,
    pub maternal_id: Option<String>,
    pub sex: Sex,
    pub phenotype: Phenotype,
}

/// `0` and `.` denote an absent parent.
fn parent(value: &str) -> Option<String> {
    match value {
        "0" | "." | "" => None,
        name => Some(name.to_string()),
    }
}

/// Parse PED content from `reader`; `path` is used in error messages.
pub fn parse_ped<R: BufRead>(reader: R, path: &str) -> Result<Vec<PedEntry>, ConfigError> {
    let mut result = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ConfigError::Read {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 6 {
            return Err(ConfigError::Pedigree {
                path: path.to_string(),
                line: idx + 1,
                reason: format!("expected 6 columns but found {}", fields.len()),
            });
        }
        result.push(PedEntry {
            family_id: fields[0].to_string(),
            name: fields[1].to_string(),
            paternal_id: parent(fields[2]),
            maternal_id: parent(fields[3]),
            sex: Sex::from_code(fields[4]),
            phenotype: Phenotype::from_code(fields[5]),
        });
    }
    Ok(result)
}

/// Load the PED file at `path`.
#[tracing::instrument]
pub fn load_ped(path: &Path) -> Result<Vec<PedEntry>, ConfigError> {
    let reader = open_read_maybe_gz(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let entries = parse_ped(reader, &path.display().to_string())?;
    tracing::debug!("read {} pedigree entries", entries.len());
    Ok(entries)
}

/// Build the samples from the header names and the optional pedigree.
pub fn build_samples(
    header_names: &[String],
    pedigree: Option<&[PedEntry]>,
) -> Result<Vec<Sample>, ConfigError> {
    let mut by_name = HashMap::new();
    for entry in pedigree.unwrap_or_default() {
        if !header_names.contains(&entry.name) {
            return Err(ConfigError::UnknownSample(entry.name.clone()));
        }
        by_name.insert(entry.name.as_str(), entry);
    }

    for entry in by_name.values() {
        for parent in [&entry.paternal_id, &entry.maternal_id].into_iter().flatten() {
            if !header_names.contains(parent) {
                tracing::debug!(
                    "parent {} of {} is not a sample of the input",
                    parent,
                    entry.name
                );
            }
        }
    }

    Ok(header_names
        .iter()
        .enumerate()
        .map(|(idx, name)| match by_name.get(name.as_str()) {
            Some(entry) => Sample {
                sample_id: idx + 1,
                name: name.clone(),
                family_id: Some(entry.family_id.clone()),
                paternal_id: entry.paternal_id.clone(),
                maternal_id: entry.maternal_id.clone(),
                sex: entry.sex,
                phenotype: entry.phenotype,
            },
            None => Sample {
                sample_id: idx + 1,
                name: name.clone(),
                family_id: None,
                paternal_id: None,
                maternal_id: None,
                sex: Sex::Unknown,
                phenotype: Phenotype::Unknown,
            },
        })
        .collect())
}
