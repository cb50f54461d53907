//! Per-code billing rule engine.
//!
//! Every identified service is checked against the rule book: quantity caps,
//! supplement prerequisites, cumulation filters, patient and diagnosis
//! requirements, package exclusions. Violations are collected, never thrown;
//! the orchestrator decides whether the quantity-reduction recovery applies.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::catalog::{normalize_code, CatalogStore};
use crate::catalog::types::RuleRow;

/// Entry of a positive cumulation list: a literal code, a chapter prefix, or
/// a Leistungsgruppe reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CumulationEntry {
    raw: String,
    kind: CumulationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CumulationKind {
    Literal(String),
    Chapter(String),
    Group(String),
}

impl CumulationEntry {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let upper = trimmed.to_uppercase();
        let kind = if let Some(rest) = upper.strip_prefix("KAPITEL") {
            CumulationKind::Chapter(rest.trim().to_string())
        } else if let Some(rest) = upper.strip_prefix("LEISTUNGSGRUPPE") {
            CumulationKind::Group(rest.trim().to_string())
        } else {
            CumulationKind::Literal(upper.clone())
        };
        Self { raw: upper, kind }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the companion code is covered by this entry. An unknown
    /// Leistungsgruppe counts as covered (forward compatibility with newer
    /// tariff releases).
    pub fn matches(&self, code: &str, store: &CatalogStore) -> bool {
        match &self.kind {
            CumulationKind::Literal(lit) => code == lit,
            CumulationKind::Chapter(prefix) => code.starts_with(prefix.as_str()),
            CumulationKind::Group(id) => match store.leistungsgruppe_members(id) {
                Some(members) => members.contains(code),
                None => true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatientRule {
    Age {
        min: Option<i64>,
        max: Option<i64>,
        exact: Option<i64>,
    },
    Gender {
        expected: Option<String>,
    },
    Medication {
        required: Vec<String>,
    },
    Other {
        field: String,
    },
}

/// Parsed rule record. `Unknown` keeps the original type string so it can be
/// logged once and otherwise treated as satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Quantity {
        max: u32,
    },
    OnlySupplementTo {
        bases: Vec<String>,
    },
    NotCumulableWith {
        codes: Vec<String>,
        type_filter: Vec<String>,
    },
    OnlyCumulableWith {
        entries: Vec<CumulationEntry>,
    },
    CumulableWith {
        entries: Vec<CumulationEntry>,
    },
    PossibleAdditions {
        entries: Vec<CumulationEntry>,
    },
    Patient(PatientRule),
    DiagnosisRequired {
        icds: Vec<String>,
    },
    PackageExclusion {
        packages: Vec<String>,
    },
    Unknown {
        typ: String,
    },
}

fn not_cumulable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Nicht kumulierbar(?:\s*\(([^)]*)\))?\s*mit$").unwrap())
}

fn codes_of(row: &RuleRow) -> Vec<String> {
    let source = if row.lkns.is_empty() { &row.lkn } else { &row.lkns };
    source.iter().map(|c| normalize_code(c)).collect()
}

fn entries_of(row: &RuleRow) -> Vec<CumulationEntry> {
    let source = if row.lkns.is_empty() { &row.lkn } else { &row.lkns };
    source.iter().map(|c| CumulationEntry::parse(c)).collect()
}

/// Parses raw rule rows into the typed rule set. Happens once at startup.
pub fn parse_rules(rows: &[RuleRow]) -> Vec<Rule> {
    rows.iter().filter_map(parse_rule).collect()
}

fn parse_rule(row: &RuleRow) -> Option<Rule> {
    let typ = row.typ.trim();
    if typ.is_empty() {
        return None;
    }

    if typ == "Mengenbeschränkung" {
        let max = row.max_quantity?;
        return Some(Rule::Quantity { max: max.max(0.0) as u32 });
    }
    if typ == "Nur als Zuschlag zu" {
        return Some(Rule::OnlySupplementTo { bases: codes_of(row) });
    }
    if typ == "Mögliche Zusatzpositionen" {
        return Some(Rule::PossibleAdditions { entries: entries_of(row) });
    }
    if typ == "Diagnosepflicht" {
        let mut icds: Vec<String> = if row.icd.is_empty() { &row.icds } else { &row.icd }
            .iter()
            .map(|c| normalize_code(c))
            .collect();
        icds.dedup();
        return Some(Rule::DiagnosisRequired { icds });
    }
    if typ == "Pauschalenausschluss" {
        let packages = if row.pauschale.is_empty() { &row.pauschalen } else { &row.pauschale }
            .iter()
            .map(|c| normalize_code(c))
            .collect();
        return Some(Rule::PackageExclusion { packages });
    }
    if typ == "Patientenbedingung" {
        let field = row.field.as_deref().unwrap_or("").trim().to_string();
        let patient = match field.to_uppercase().as_str() {
            "ALTER" => PatientRule::Age {
                min: row.min_value,
                max: row.max_value,
                exact: row.value.first().and_then(|v| v.parse().ok()),
            },
            "GESCHLECHT" => PatientRule::Gender {
                expected: row.value.first().cloned(),
            },
            "GTIN" | "MEDIKAMENTE" | "MEDIKAMENT" | "ATC" => PatientRule::Medication {
                required: row.value.iter().map(|v| normalize_code(v)).collect(),
            },
            _ => PatientRule::Other { field },
        };
        return Some(Rule::Patient(patient));
    }
    if let Some(caps) = not_cumulable_regex().captures(typ) {
        let type_filter = caps
            .get(1)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(|t| t.trim().to_uppercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        return Some(Rule::NotCumulableWith {
            codes: codes_of(row),
            type_filter,
        });
    }
    if typ.starts_with("Nur kumulierbar") {
        return Some(Rule::OnlyCumulableWith { entries: entries_of(row) });
    }
    if typ.starts_with("Kumulierbar") {
        return Some(Rule::CumulableWith { entries: entries_of(row) });
    }

    Some(Rule::Unknown { typ: typ.to_string() })
}

/// Fact record for one service position within an encounter.
#[derive(Debug, Clone, Default)]
pub struct BillingCase {
    pub lkn: String,
    pub typ: Option<String>,
    pub quantity: u32,
    pub companions: Vec<String>,
    pub companion_types: HashMap<String, String>,
    pub age: Option<i64>,
    pub gender: Option<String>,
    pub medications: Vec<String>,
    pub icd_codes: Vec<String>,
    pub active_pauschalen: Vec<String>,
}

impl BillingCase {
    /// Canonicalises all codes and types to upper-case.
    pub fn normalized(mut self) -> Self {
        self.lkn = normalize_code(&self.lkn);
        self.typ = self.typ.map(|t| t.to_uppercase());
        self.companions = self.companions.iter().map(|c| normalize_code(c)).collect();
        self.companion_types = self
            .companion_types
            .iter()
            .map(|(k, v)| (normalize_code(k), v.to_uppercase()))
            .collect();
        self.medications = self.medications.iter().map(|m| normalize_code(m)).collect();
        self.icd_codes = self.icd_codes.iter().map(|c| normalize_code(c)).collect();
        self.active_pauschalen = self
            .active_pauschalen
            .iter()
            .map(|c| normalize_code(c))
            .collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Quantity,
    OnlySupplement,
    NotCumulable,
    OnlyCumulable,
    PatientCondition,
    DiagnosisRequired,
    PackageExclusion,
    Internal,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleViolation {
    pub kind: ViolationKind,
    /// German message template instance; translated at the response edge.
    pub message: String,
    /// Cap carried by quantity violations so the orchestrator can reduce
    /// without re-parsing the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_cap: Option<u32>,
}

impl RuleViolation {
    fn new(kind: ViolationKind, message: String) -> Self {
        Self {
            kind,
            message,
            quantity_cap: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleCheck {
    pub billable: bool,
    pub violations: Vec<RuleViolation>,
    /// Advisory additions collected from Kumulierbar/Zusatzpositionen rules.
    pub possible_additions: Vec<String>,
}

impl RuleCheck {
    /// True when the only thing standing in the way is a quantity cap; the
    /// orchestrator may then reduce the quantity instead of rejecting.
    pub fn only_quantity_violations(&self) -> Option<u32> {
        if self.billable || self.violations.is_empty() {
            return None;
        }
        let mut cap: Option<u32> = None;
        for violation in &self.violations {
            match violation.kind {
                ViolationKind::Quantity => {
                    let this = violation.quantity_cap.unwrap_or(0);
                    cap = Some(cap.map_or(this, |c| c.min(this)));
                }
                _ => return None,
            }
        }
        cap
    }
}

/// Checks one service position against its rule set.
///
/// Unknown rule types are logged and treated as satisfied so that newer
/// tariff releases do not break billing.
pub fn check_billability(
    case: &BillingCase,
    store: &CatalogStore,
    kumulation_explizit: bool,
) -> RuleCheck {
    let rules = store.rules(&case.lkn);
    let mut check = RuleCheck {
        billable: true,
        ..Default::default()
    };
    if rules.is_empty() {
        return check;
    }

    let mut hints: Vec<CumulationEntry> = Vec::new();
    let mut has_cumulable_rule = false;

    for rule in rules {
        match rule {
            Rule::Quantity { max } => {
                if case.quantity > *max {
                    let mut violation = RuleViolation::new(
                        ViolationKind::Quantity,
                        format!(
                            "Mengenbeschränkung überschritten (max. {max}, angefragt {})",
                            case.quantity
                        ),
                    );
                    violation.quantity_cap = Some(*max);
                    check.violations.push(violation);
                }
            }
            Rule::OnlySupplementTo { bases } => {
                if bases.is_empty() {
                    debug!(lkn = %case.lkn, "supplement rule without base codes ignored");
                    continue;
                }
                if !bases.iter().any(|base| case.companions.contains(base)) {
                    check.violations.push(RuleViolation::new(
                        ViolationKind::OnlySupplement,
                        format!(
                            "Nur als Zuschlag zu {} zulässig (Basis fehlt)",
                            bases.join(", ")
                        ),
                    ));
                }
            }
            Rule::NotCumulableWith { codes, type_filter } => {
                let mut conflicts: Vec<&str> = Vec::new();
                for companion in &case.companions {
                    if !codes.contains(companion) {
                        continue;
                    }
                    if type_filter.is_empty() {
                        conflicts.push(companion);
                        continue;
                    }
                    match case.companion_types.get(companion) {
                        Some(typ) if type_filter.contains(typ) => conflicts.push(companion),
                        Some(_) => {}
                        None => conflicts.push(companion),
                    }
                }
                if !conflicts.is_empty() {
                    check.violations.push(RuleViolation::new(
                        ViolationKind::NotCumulable,
                        format!("Nicht kumulierbar mit: {}", conflicts.join(", ")),
                    ));
                }
            }
            Rule::OnlyCumulableWith { entries } => {
                let unmatched: Vec<&str> = case
                    .companions
                    .iter()
                    .filter(|companion| {
                        !entries.iter().any(|entry| entry.matches(companion, store))
                    })
                    .map(String::as_str)
                    .collect();
                if !unmatched.is_empty() {
                    let allowed: Vec<&str> = entries.iter().map(CumulationEntry::raw).collect();
                    check.violations.push(RuleViolation::new(
                        ViolationKind::OnlyCumulable,
                        format!("Nur kumulierbar mit: {}", allowed.join(", ")),
                    ));
                }
            }
            Rule::CumulableWith { entries } => {
                hints.extend(entries.iter().cloned());
                has_cumulable_rule = true;
            }
            Rule::PossibleAdditions { entries } => {
                hints.extend(entries.iter().cloned());
            }
            Rule::Patient(patient) => check_patient_rule(patient, case, &mut check),
            Rule::DiagnosisRequired { icds } => {
                if !icds.is_empty() && !icds.iter().any(|icd| case.icd_codes.contains(icd)) {
                    check.violations.push(RuleViolation::new(
                        ViolationKind::DiagnosisRequired,
                        format!(
                            "Erforderliche Diagnose(n) nicht vorhanden (Benötigt: {})",
                            icds.join(", ")
                        ),
                    ));
                }
            }
            Rule::PackageExclusion { packages } => {
                if packages
                    .iter()
                    .any(|p| case.active_pauschalen.contains(p))
                {
                    check.violations.push(RuleViolation::new(
                        ViolationKind::PackageExclusion,
                        format!(
                            "Leistung nicht zulässig bei gleichzeitiger Abrechnung der Pauschale(n): {}",
                            packages.join(", ")
                        ),
                    ));
                }
            }
            Rule::Unknown { typ } => {
                warn!(lkn = %case.lkn, rule_type = %typ, "unknown rule type ignored");
            }
        }
    }

    // Positive cumulation hints become restrictive only with the explicit
    // flag AND at least one Kumulierbar rule present.
    if kumulation_explizit && has_cumulable_rule && !hints.is_empty() {
        let unmatched: Vec<&str> = case
            .companions
            .iter()
            .filter(|companion| !hints.iter().any(|entry| entry.matches(companion, store)))
            .map(String::as_str)
            .collect();
        if !unmatched.is_empty() {
            let allowed: Vec<&str> = hints.iter().map(CumulationEntry::raw).collect();
            check.violations.push(RuleViolation::new(
                ViolationKind::OnlyCumulable,
                format!("Nur kumulierbar mit: {}", allowed.join(", ")),
            ));
        }
    }

    let mut seen = std::collections::HashSet::new();
    check.possible_additions = hints
        .iter()
        .map(|e| e.raw().to_string())
        .filter(|e| seen.insert(e.clone()))
        .collect();
    check.billable = check.violations.is_empty();
    check
}

fn check_patient_rule(rule: &PatientRule, case: &BillingCase, check: &mut RuleCheck) {
    match rule {
        PatientRule::Age { min, max, exact } => {
            let Some(age) = case.age else {
                check.violations.push(RuleViolation::new(
                    ViolationKind::PatientCondition,
                    "Patientenbedingung (Alter) nicht erfüllt: Kontextwert fehlt".to_string(),
                ));
                return;
            };
            let mut parts = Vec::new();
            if let Some(min) = min {
                if age < *min {
                    parts.push(format!("min. {min}"));
                }
            }
            if let Some(max) = max {
                if age > *max {
                    parts.push(format!("max. {max}"));
                }
            }
            if let Some(exact) = exact {
                if age != *exact {
                    parts.push(format!("exakt {exact}"));
                }
            }
            if !parts.is_empty() {
                check.violations.push(RuleViolation::new(
                    ViolationKind::PatientCondition,
                    format!(
                        "Patientenbedingung (Alter) ({}) nicht erfüllt (Patient: {age})",
                        parts.join(" ")
                    ),
                ));
            }
        }
        PatientRule::Gender { expected } => {
            let (Some(expected), Some(found)) = (expected.as_deref(), case.gender.as_deref())
            else {
                check.violations.push(RuleViolation::new(
                    ViolationKind::PatientCondition,
                    "Patientenbedingung (Geschlecht): Ungültige Werte für Geschlechtsprüfung"
                        .to_string(),
                ));
                return;
            };
            if !expected.eq_ignore_ascii_case(found) {
                check.violations.push(RuleViolation::new(
                    ViolationKind::PatientCondition,
                    format!(
                        "Patientenbedingung (Geschlecht): erwartet '{expected}', gefunden '{found}'"
                    ),
                ));
            }
        }
        PatientRule::Medication { required } => {
            if !required.iter().any(|r| case.medications.contains(r)) {
                check.violations.push(RuleViolation::new(
                    ViolationKind::PatientCondition,
                    format!(
                        "Patientenbedingung (Medikamente): Erwartet einen von [{}], nicht gefunden",
                        required.join(", ")
                    ),
                ));
            }
        }
        PatientRule::Other { field } => {
            debug!(lkn = %case.lkn, %field, "unknown patient condition field ignored");
        }
    }
}
