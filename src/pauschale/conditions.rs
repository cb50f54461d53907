//! Package condition parsing and evaluation.
//!
//! Raw condition rows are compiled once per package into typed atoms plus
//! the boolean skeleton (group ids and row operators). Evaluation walks the
//! compiled structure against the request context: structured semantics when
//! the rows carry groups, the legacy group-OR fallback otherwise.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::catalog::types::{ConditionRow, Language};
use crate::catalog::{normalize_code, CatalogStore, TableCache};
use crate::context::BillingContext;

use super::expression::{evaluate_rpn, shunting_yard, tokenize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("<") => Comparator::Lt,
            Some("<=") => Comparator::Le,
            Some(">") => Comparator::Gt,
            Some(">=") => Comparator::Ge,
            _ => Comparator::Eq,
        }
    }

    fn holds(&self, left: i64, right: i64) -> bool {
        match self {
            Comparator::Eq => left == right,
            Comparator::Lt => left < right,
            Comparator::Le => left <= right,
            Comparator::Gt => left > right,
            Comparator::Ge => left >= right,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

/// Typed condition atom. One variant per condition kind; `Unknown` keeps the
/// raw type for logging and the configurable strict/lenient handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionAtom {
    IcdList { codes: Vec<String> },
    IcdTable { tables: Vec<String> },
    LknList { codes: Vec<String> },
    LknTable { tables: Vec<String> },
    MedicationList { codes: Vec<String> },
    GenderList { genders: Vec<String> },
    PatientAge {
        min: Option<i64>,
        max: Option<i64>,
        exact: Option<i64>,
    },
    PatientGender { expected: Option<String> },
    CountCheck { value: i64, comparator: Comparator },
    LateralityCheck { value: String },
    Unknown { condition_type: String },
}

impl ConditionAtom {
    pub fn is_icd(&self) -> bool {
        matches!(self, ConditionAtom::IcdList { .. } | ConditionAtom::IcdTable { .. })
    }

    pub fn is_lkn(&self) -> bool {
        matches!(self, ConditionAtom::LknList { .. } | ConditionAtom::LknTable { .. })
    }

    /// Simplified (kind, payload) tuple used for the sibling comparison.
    pub fn simplified(&self) -> (String, String) {
        fn joined(values: &[String]) -> String {
            let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.join(",")
        }
        match self {
            ConditionAtom::IcdList { codes } => ("ICD_LIST".into(), joined(codes)),
            ConditionAtom::IcdTable { tables } => ("ICD_TABLE".into(), joined(tables)),
            ConditionAtom::LknList { codes } => ("LKN_LIST".into(), joined(codes)),
            ConditionAtom::LknTable { tables } => ("LKN_TABLE".into(), joined(tables)),
            ConditionAtom::MedicationList { codes } => ("MEDICATION_LIST".into(), joined(codes)),
            ConditionAtom::GenderList { genders } => {
                ("GESCHLECHT_LIST_CHECK".into(), joined(genders))
            }
            ConditionAtom::PatientAge { min, max, exact } => {
                let payload = match exact {
                    Some(v) => format!("= {v}"),
                    None => format!(
                        "{}-{}",
                        min.map(|v| v.to_string()).unwrap_or_default(),
                        max.map(|v| v.to_string()).unwrap_or_default()
                    ),
                };
                ("PATIENT_ALTER".into(), payload)
            }
            ConditionAtom::PatientGender { expected } => (
                "PATIENT_GESCHLECHT".into(),
                expected.clone().unwrap_or_default(),
            ),
            ConditionAtom::CountCheck { value, comparator } => {
                ("ANZAHL_CHECK".into(), format!("{} {value}", comparator.as_str()))
            }
            ConditionAtom::LateralityCheck { value } => {
                ("SEITIGKEIT_CHECK".into(), value.clone())
            }
            ConditionAtom::Unknown { condition_type } => (condition_type.clone(), String::new()),
        }
    }
}

/// Boolean connective a row carries towards the *next* atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowOperator {
    #[default]
    And,
    Or,
    AndNot,
    OrNot,
}

impl RowOperator {
    fn parse(raw: Option<&str>) -> Option<Self> {
        let value = raw?.trim().to_uppercase();
        match value.as_str() {
            "UND" | "AND" => Some(RowOperator::And),
            "ODER" | "OR" => Some(RowOperator::Or),
            "UND NICHT" | "AND NOT" => Some(RowOperator::AndNot),
            "ODER NICHT" | "OR NOT" => Some(RowOperator::OrNot),
            _ => None,
        }
    }

    fn infix(&self) -> &'static str {
        match self {
            RowOperator::And => "and",
            RowOperator::Or => "or",
            RowOperator::AndNot => "and not",
            RowOperator::OrNot => "or not",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub atom: ConditionAtom,
    pub group: Option<i64>,
    pub operator: Option<RowOperator>,
    /// Raw row type and payload, kept for the explanation renderer.
    pub raw_type: String,
    pub raw_values: String,
}

#[derive(Debug, Clone)]
pub struct CompiledStructure {
    pub conditions: Vec<CompiledCondition>,
    /// True when every row carries a group id (structured semantics apply).
    pub structured: bool,
}

fn split_values(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

fn split_codes(raw: Option<&str>) -> Vec<String> {
    split_values(raw).iter().map(|v| normalize_code(v)).collect()
}

fn split_tables(raw: Option<&str>) -> Vec<String> {
    split_values(raw)
        .iter()
        .map(|v| v.to_lowercase())
        .collect()
}

fn parse_atom(row: &ConditionRow) -> ConditionAtom {
    let typ = row.condition_type.trim().to_uppercase();
    match typ.as_str() {
        "ICD" | "ICD IN LISTE" | "HAUPTDIAGNOSE IN LISTE" => ConditionAtom::IcdList {
            codes: split_codes(row.values.as_deref()),
        },
        "HAUPTDIAGNOSE IN TABELLE" | "ICD IN TABELLE" => ConditionAtom::IcdTable {
            tables: split_tables(row.values.as_deref()),
        },
        "LKN" | "LEISTUNGSPOSITIONEN IN LISTE" => ConditionAtom::LknList {
            codes: split_codes(row.values.as_deref()),
        },
        "LEISTUNGSPOSITIONEN IN TABELLE" | "TARIFPOSITIONEN IN TABELLE" => {
            ConditionAtom::LknTable {
                tables: split_tables(row.values.as_deref()),
            }
        }
        "GTIN" | "MEDIKAMENTE IN LISTE" => ConditionAtom::MedicationList {
            codes: split_codes(row.values.as_deref()),
        },
        "GESCHLECHT IN LISTE" => ConditionAtom::GenderList {
            genders: split_values(row.values.as_deref())
                .iter()
                .map(|v| v.to_lowercase())
                .collect(),
        },
        "PATIENTENBEDINGUNG" => {
            let field = row.field.as_deref().unwrap_or("").trim().to_uppercase();
            match field.as_str() {
                "ALTER" => ConditionAtom::PatientAge {
                    min: row.min_value,
                    max: row.max_value,
                    exact: row.value.as_deref().and_then(|v| v.trim().parse().ok()),
                },
                "GESCHLECHT" => ConditionAtom::PatientGender {
                    expected: row.value.clone().filter(|v| !v.trim().is_empty()),
                },
                _ => ConditionAtom::Unknown {
                    condition_type: format!("{typ} ({field})"),
                },
            }
        }
        "ANZAHL" => {
            let value = row
                .values
                .as_deref()
                .or(row.value.as_deref())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            ConditionAtom::CountCheck {
                value,
                comparator: Comparator::parse(row.comparator.as_deref()),
            }
        }
        "SEITIGKEIT" => ConditionAtom::LateralityCheck {
            value: row
                .values
                .as_deref()
                .or(row.value.as_deref())
                .unwrap_or("")
                .trim()
                .to_lowercase(),
        },
        _ => ConditionAtom::Unknown {
            condition_type: typ,
        },
    }
}

/// Compiles the rows of one package. Deterministic; done once per package
/// behind the process-wide [`StructureIndex`].
pub fn compile_conditions(rows: &[ConditionRow]) -> CompiledStructure {
    let conditions: Vec<CompiledCondition> = rows
        .iter()
        .map(|row| CompiledCondition {
            atom: parse_atom(row),
            group: row.group,
            operator: RowOperator::parse(row.operator.as_deref()),
            raw_type: row.condition_type.clone(),
            raw_values: row.values.clone().unwrap_or_default(),
        })
        .collect();
    let structured = !conditions.is_empty() && conditions.iter().all(|c| c.group.is_some());
    CompiledStructure {
        conditions,
        structured,
    }
}

/// Process-wide compiled-structure cache, write-once per package code.
#[derive(Default)]
pub struct StructureIndex {
    inner: RwLock<HashMap<String, Arc<CompiledStructure>>>,
}

impl StructureIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, code: &str, store: &CatalogStore) -> Arc<CompiledStructure> {
        let key = normalize_code(code);
        if let Some(hit) = self.inner.read().expect("structure index poisoned").get(&key) {
            return Arc::clone(hit);
        }
        let compiled = Arc::new(compile_conditions(store.pauschale_conditions(&key)));
        let mut guard = self.inner.write().expect("structure index poisoned");
        Arc::clone(guard.entry(key).or_insert(compiled))
    }
}

/// Outcome of evaluating one atom, kept for the explanation renderer.
#[derive(Debug, Clone)]
pub struct ConditionResult {
    pub atom: ConditionAtom,
    pub group: Option<i64>,
    pub operator: Option<RowOperator>,
    pub met: bool,
}

#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    pub applicable: bool,
    pub results: Vec<ConditionResult>,
    pub errors: Vec<String>,
}

/// Evaluates one typed atom against the request context.
pub fn evaluate_atom(
    atom: &ConditionAtom,
    context: &BillingContext,
    store: &CatalogStore,
    cache: &mut TableCache,
    strict: bool,
    errors: &mut Vec<String>,
) -> bool {
    match atom {
        ConditionAtom::IcdList { codes } => {
            if !context.use_icd {
                return true;
            }
            codes.iter().any(|c| context.icd_codes.contains(c))
        }
        ConditionAtom::IcdTable { tables } => {
            if !context.use_icd {
                return true;
            }
            let entries =
                store.table_entries(&tables.join(","), "icd", Language::De, cache);
            entries
                .iter()
                .any(|e| context.icd_codes.contains(&normalize_code(&e.code)))
        }
        ConditionAtom::LknList { codes } => {
            codes.iter().any(|c| context.lkn_codes.contains(c))
        }
        ConditionAtom::LknTable { tables } => {
            let entries =
                store.table_entries(&tables.join(","), "service_catalog", Language::De, cache);
            entries
                .iter()
                .any(|e| context.lkn_codes.contains(&normalize_code(&e.code)))
        }
        ConditionAtom::MedicationList { codes } => {
            codes.iter().any(|c| context.medications.contains(c))
        }
        ConditionAtom::GenderList { genders } => {
            if genders.is_empty() {
                return true;
            }
            match context.gender.as_deref() {
                Some(gender) => genders.iter().any(|g| g.eq_ignore_ascii_case(gender)),
                None => false,
            }
        }
        ConditionAtom::PatientAge { min, max, exact } => {
            let Some(age) = context.age else {
                return false;
            };
            if let Some(exact) = exact {
                return age == *exact;
            }
            min.map_or(true, |m| age >= m) && max.map_or(true, |m| age <= m)
        }
        ConditionAtom::PatientGender { expected } => match (expected, &context.gender) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(exp), Some(found)) => exp.eq_ignore_ascii_case(found),
        },
        ConditionAtom::CountCheck { value, comparator } => context
            .effective_procedure_count()
            .is_some_and(|count| comparator.holds(count, *value)),
        ConditionAtom::LateralityCheck { value } => {
            let expected = crate::context::normalize_laterality(value);
            let found = context.laterality.clone();
            match (expected, found) {
                (Some(e), Some(f)) => e == f,
                (None, _) => true,
                _ => false,
            }
        }
        ConditionAtom::Unknown { condition_type } => {
            if strict {
                errors.push(format!("Unbekannter Bedingungstyp: {condition_type}"));
                false
            } else {
                warn!(%condition_type, "unknown condition type treated as met");
                true
            }
        }
    }
}

/// Evaluates a compiled package structure against the context.
///
/// Structured semantics build the infix expression (atoms joined by each
/// row's operator, parentheses at group boundaries), run it through the
/// shunting-yard and evaluate the RPN. The fallback treats each group as
/// implicit-AND and the set of groups as implicit-OR. A package without
/// condition rows is applicable.
pub fn evaluate_structure(
    structure: &CompiledStructure,
    context: &BillingContext,
    store: &CatalogStore,
    cache: &mut TableCache,
    strict: bool,
) -> ConditionOutcome {
    let mut errors = Vec::new();
    if structure.conditions.is_empty() {
        return ConditionOutcome {
            applicable: true,
            results: Vec::new(),
            errors,
        };
    }

    let results: Vec<ConditionResult> = structure
        .conditions
        .iter()
        .map(|condition| ConditionResult {
            met: evaluate_atom(&condition.atom, context, store, cache, strict, &mut errors),
            atom: condition.atom.clone(),
            group: condition.group,
            operator: condition.operator,
        })
        .collect();

    let applicable = if structure.structured {
        evaluate_structured(&results)
    } else {
        evaluate_grouped_fallback(&results)
    };

    ConditionOutcome {
        applicable,
        results,
        errors,
    }
}

fn evaluate_structured(results: &[ConditionResult]) -> bool {
    let mut expression = String::from("(");
    for (index, result) in results.iter().enumerate() {
        expression.push_str(if result.met { "true" } else { "false" });
        match results.get(index + 1) {
            Some(next) => {
                let operator = result.operator.unwrap_or_default().infix();
                if next.group == result.group {
                    expression.push_str(&format!(" {operator} "));
                } else {
                    expression.push_str(&format!(") {operator} ("));
                }
            }
            None => expression.push(')'),
        }
    }
    let rpn = shunting_yard(&tokenize(&expression));
    evaluate_rpn(&rpn, &HashMap::new())
}

fn evaluate_grouped_fallback(results: &[ConditionResult]) -> bool {
    let mut groups: HashMap<i64, bool> = HashMap::new();
    for result in results {
        let entry = groups.entry(result.group.unwrap_or(1)).or_insert(true);
        *entry = *entry && result.met;
    }
    groups.values().any(|met| *met)
}
