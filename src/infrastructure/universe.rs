//! Symbol universe: security id to company display name, loaded once at
//! startup from a CSV mapping file.

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct UniverseRow {
    #[serde(rename = "SECURITY_ID")]
    security_id: String,
    #[serde(rename = "CompanyName")]
    company_name: String,
}

#[derive(Debug, Default)]
pub struct SymbolUniverse {
    names: HashMap<u32, String>,
    security_ids: Vec<String>,
}

impl SymbolUniverse {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open universe file {}", path.display()))?;
        Self::from_reader(reader)
    }

    fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut names = HashMap::new();
        let mut security_ids = Vec::new();

        for row in reader.deserialize::<UniverseRow>() {
            let row = row.context("malformed universe row")?;
            let id = row.security_id.trim().to_string();
            if id.is_empty() {
                continue;
            }
            if let Ok(numeric) = id.parse::<u32>() {
                names.insert(numeric, row.company_name.trim().to_string());
            }
            security_ids.push(id);
        }

        ensure!(!security_ids.is_empty(), "universe file contains no security ids");
        Ok(Self {
            names,
            security_ids,
        })
    }

    /// Company display name for a decoded security id; unknown ids fall
    /// back to the numeric id so their candles are still captured.
    pub fn display_name(&self, security_id: u32) -> String {
        self.names
            .get(&security_id)
            .cloned()
            .unwrap_or_else(|| security_id.to_string())
    }

    /// Ids in file order, as sent in subscription messages.
    pub fn security_ids(&self) -> &[String] {
        &self.security_ids
    }

    pub fn len(&self) -> usize {
        self.security_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.security_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe(csv_text: &str) -> Result<SymbolUniverse> {
        SymbolUniverse::from_reader(csv::Reader::from_reader(csv_text.as_bytes()))
    }

    #[test]
    fn loads_mapping_rows() {
        let u = universe(
            "SECURITY_ID,CompanyName\n1333,HDFC Bank\n11536,Tata Consultancy Services\n",
        )
        .unwrap();
        assert_eq!(u.len(), 2);
        assert_eq!(u.display_name(1333), "HDFC Bank");
        assert_eq!(u.security_ids(), ["1333", "11536"]);
    }

    #[test]
    fn unknown_id_falls_back_to_numeric_string() {
        let u = universe("SECURITY_ID,CompanyName\n1333,HDFC Bank\n").unwrap();
        assert_eq!(u.display_name(9999), "9999");
    }

    #[test]
    fn empty_universe_is_an_error() {
        assert!(universe("SECURITY_ID,CompanyName\n").is_err());
    }
}
