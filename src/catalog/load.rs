//! Catalogue file loading.
//!
//! The engine consumes the JSON files of the official tariff release
//! unchanged. Loading happens once at startup; a missing optional file
//! (synonyms, Leistungsgruppen, embeddings) degrades the related feature
//! instead of failing the boot.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::{Result, TarifError};
use crate::retrieval::EmbeddingIndex;

use super::types::{
    CatalogEntry, ConditionRow, EmbeddingRow, GroupRow, PauschaleDef, RuleBookEntry,
    ServiceLinkRow, SynonymEntry, TableRow,
};
use super::CatalogStore;

const CATALOG_FILE: &str = "tblLeistungskatalog.json";
const RULE_BOOK_FILE: &str = "strukturierte_regeln_komplett.json";
const PAUSCHALEN_FILE: &str = "tblPauschalen.json";
const CONDITIONS_FILE: &str = "tblPauschaleBedingungen.json";
const SERVICE_LINKS_FILE: &str = "tblPauschaleLeistungsposition.json";
const TABLES_FILE: &str = "tblTabellen.json";
const GROUPS_FILE: &str = "tblLeistungsgruppen.json";
const SYNONYMS_FILE: &str = "synonyms.json";
const EMBEDDINGS_FILE: &str = "embeddings.json";
const VERSION_FILE: &str = "tarifversion.txt";

fn read_required<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>> {
    let path: PathBuf = dir.join(file);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| TarifError::Catalog(format!("{}: {e}", path.display())))?;
    let rows: Vec<T> = serde_json::from_str(&raw)
        .map_err(|e| TarifError::Catalog(format!("{}: {e}", path.display())))?;
    Ok(rows)
}

fn read_optional<T: DeserializeOwned>(dir: &Path, file: &str) -> Vec<T> {
    let path = dir.join(file);
    if !path.is_file() {
        return Vec::new();
    }
    match std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str::<Vec<T>>(&raw).map_err(|e| e.to_string()))
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(file = %path.display(), %err, "optional catalogue file ignored");
            Vec::new()
        }
    }
}

/// Loads all catalogue files from `dir` into an immutable store plus the
/// optional embedding index.
pub fn load_catalog(dir: &Path) -> Result<(CatalogStore, Option<EmbeddingIndex>)> {
    let catalog: Vec<CatalogEntry> = read_required(dir, CATALOG_FILE)?;
    let rule_book: Vec<RuleBookEntry> = read_required(dir, RULE_BOOK_FILE)?;
    let pauschalen: Vec<PauschaleDef> = read_required(dir, PAUSCHALEN_FILE)?;
    let conditions: Vec<ConditionRow> = read_required(dir, CONDITIONS_FILE)?;
    let links: Vec<ServiceLinkRow> = read_required(dir, SERVICE_LINKS_FILE)?;
    let tables: Vec<TableRow> = read_required(dir, TABLES_FILE)?;

    let groups: Vec<GroupRow> = read_optional(dir, GROUPS_FILE);
    let synonyms: Vec<SynonymEntry> = read_optional(dir, SYNONYMS_FILE);

    let tariff_version = std::fs::read_to_string(dir.join(VERSION_FILE))
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    info!(
        services = catalog.len(),
        pauschalen = pauschalen.len(),
        conditions = conditions.len(),
        tables = tables.len(),
        rules = rule_book.len(),
        "catalogue loaded"
    );

    let embeddings = {
        let rows: Vec<EmbeddingRow> = read_optional(dir, EMBEDDINGS_FILE);
        if rows.is_empty() {
            None
        } else {
            Some(EmbeddingIndex::from_rows(rows))
        }
    };

    let store = CatalogStore::new(
        catalog,
        rule_book,
        tables,
        pauschalen,
        conditions,
        links,
        groups,
        synonyms,
        tariff_version,
    );
    Ok((store, embeddings))
}
