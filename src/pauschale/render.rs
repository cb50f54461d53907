//! HTML rendering for package condition checks and the selection rationale.
//!
//! The fragments feed the assistant UI: a per-condition met/not-met list,
//! the winner explanation, and the comparison against sibling packages of
//! the same base family.

use std::fmt::Write as _;
use std::sync::OnceLock;

use minijinja::{context, Environment};

use crate::catalog::types::Language;
use crate::catalog::{CatalogStore, TableCache};
use crate::i18n::{translate, translate_fmt};

use super::conditions::{ConditionAtom, ConditionOutcome};

/// Escapes HTML special characters (same set as the UI expects).
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

const EXPLANATION_TEMPLATE: &str = r#"<div class="pauschale-explanation">
<p><b>{{ code }}</b>: {{ text }} {{ verdict }}</p>
<p>{{ logic_header }}</p>
{{ condition_html }}
{% if siblings %}<p>{{ comparison_header }}</p>
{% for sibling in siblings %}<details class="sibling-comparison"><summary><b>{{ sibling.code }}</b>: {{ sibling.text }}</summary>
{% if sibling.bullets %}<ul>
{% for bullet in sibling.bullets %}<li>{{ bullet }}</li>
{% endfor %}</ul>
{% else %}<p><i>{{ no_differences }}</i></p>
{% endif %}</details>
{% endfor %}{% endif %}</div>"#;

fn template_env() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.add_template("explanation", EXPLANATION_TEMPLATE)
            .expect("explanation template parses");
        env
    })
}

fn describe_code_list(codes: &[String], describe: impl Fn(&str) -> String) -> String {
    codes
        .iter()
        .map(|code| format!("<b>{}</b> ({})", escape(code), escape(&describe(code))))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_tables(
    tables: &[String],
    table_type: &str,
    store: &CatalogStore,
    lang: Language,
    cache: &mut TableCache,
) -> String {
    let entries_label = translate("entries_label", lang);
    tables
        .iter()
        .map(|table| {
            let entries = store.table_entries(table, table_type, lang, cache);
            let mut details = format!(
                "<details class=\"inline-table-details\"><summary>{}</summary> ({} {entries_label})",
                escape(&table.to_uppercase()),
                entries.len()
            );
            if !entries.is_empty() {
                details.push_str("<ul>");
                for entry in entries.iter() {
                    let _ = write!(
                        details,
                        "<li><b>{}</b>: {}</li>",
                        escape(&entry.code),
                        escape(&entry.text)
                    );
                }
                details.push_str("</ul>");
            }
            details.push_str("</details>");
            details
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// One human-readable line for a condition atom, with catalogue descriptions
/// resolved in the request language.
pub fn describe_atom(
    atom: &ConditionAtom,
    store: &CatalogStore,
    lang: Language,
    cache: &mut TableCache,
) -> String {
    match atom {
        ConditionAtom::LknList { codes } => format!(
            "{}{}",
            translate("require_lkn_list", lang),
            describe_code_list(codes, |c| store.lkn_description(c, lang))
        ),
        ConditionAtom::LknTable { tables } => format!(
            "{}{}",
            translate("require_lkn_table", lang),
            describe_tables(tables, "service_catalog", store, lang, cache)
        ),
        ConditionAtom::IcdList { codes } => format!(
            "{}{}",
            translate("require_icd_list", lang),
            describe_code_list(codes, |c| store.icd_description(c, lang))
        ),
        ConditionAtom::IcdTable { tables } => format!(
            "{}{}",
            translate("require_icd_table", lang),
            describe_tables(tables, "icd", store, lang, cache)
        ),
        ConditionAtom::MedicationList { codes } => format!(
            "{}{}",
            translate("require_medication_list", lang),
            escape(&codes.join(", "))
        ),
        ConditionAtom::GenderList { genders } => format!(
            "{}{}",
            translate("geschlecht_list", lang),
            escape(&genders.join(", "))
        ),
        ConditionAtom::PatientAge { min, max, exact } => {
            let value = match exact {
                Some(v) => format!("= {v}"),
                None => format!(
                    "{} - {}",
                    min.map(|v| v.to_string()).unwrap_or_else(|| "*".into()),
                    max.map(|v| v.to_string()).unwrap_or_else(|| "*".into())
                ),
            };
            translate_fmt(
                "patient_condition",
                lang,
                &[("field", "Alter"), ("value", &escape(&value))],
            )
        }
        ConditionAtom::PatientGender { expected } => translate_fmt(
            "patient_condition",
            lang,
            &[
                ("field", "Geschlecht"),
                ("value", &escape(expected.as_deref().unwrap_or("-"))),
            ],
        ),
        ConditionAtom::CountCheck { value, comparator } => translate_fmt(
            "anzahl_condition",
            lang,
            &[("value", &escape(&format!("{} {value}", comparator.as_str())))],
        ),
        ConditionAtom::LateralityCheck { value } => {
            translate_fmt("seitigkeit_condition", lang, &[("value", &escape(value))])
        }
        ConditionAtom::Unknown { condition_type } => escape(condition_type),
    }
}

fn status_span(met: bool, lang: Language) -> String {
    if met {
        format!(
            "<span class=\"condition-status met\">{}</span>",
            escape(translate("met", lang))
        )
    } else {
        format!(
            "<span class=\"condition-status not-met\">{}</span>",
            escape(translate("not_met", lang))
        )
    }
}

/// Renders the per-condition check list, grouped by logic group.
pub fn render_condition_results(
    outcome: &ConditionOutcome,
    store: &CatalogStore,
    lang: Language,
    cache: &mut TableCache,
) -> String {
    if outcome.results.is_empty() {
        return format!("<ul><li>{}</li></ul>", escape(translate("no_conditions", lang)));
    }

    let mut html = String::new();
    let mut current_group: Option<Option<i64>> = None;
    for result in &outcome.results {
        if current_group != Some(result.group) {
            if current_group.is_some() {
                html.push_str("</ul>");
            }
            if let Some(group) = result.group {
                let header =
                    translate_fmt("group_logic", lang, &[("id", &group.to_string())]);
                let _ = write!(html, "<p class=\"group-header\">{}</p>", escape(&header));
            }
            html.push_str("<ul class=\"condition-list\">");
            current_group = Some(result.group);
        }
        let _ = write!(
            html,
            "<li>{}: {}</li>",
            describe_atom(&result.atom, store, lang, cache),
            status_span(result.met, lang)
        );
    }
    html.push_str("</ul>");
    html
}

/// A sibling package and the condition-tuple differences against the winner.
#[derive(Debug, Clone)]
pub struct SiblingDiff {
    pub code: String,
    pub text: String,
    /// Conditions the sibling has that the winner does not.
    pub added: Vec<ConditionAtom>,
    /// Winner conditions the sibling does not have.
    pub missing: Vec<ConditionAtom>,
}

/// Renders the full winner explanation: verdict line, condition list and the
/// comparison against siblings of the same base family.
pub fn render_explanation(
    code: &str,
    text: &str,
    outcome: &ConditionOutcome,
    siblings: &[SiblingDiff],
    store: &CatalogStore,
    lang: Language,
    cache: &mut TableCache,
) -> String {
    let condition_html = render_condition_results(outcome, store, lang, cache);
    let verdict = translate(
        if outcome.applicable {
            "conditions_met"
        } else {
            "conditions_not_met"
        },
        lang,
    );

    let sibling_ctx: Vec<minijinja::Value> = siblings
        .iter()
        .map(|sibling| {
            let mut bullets: Vec<String> = Vec::new();
            for atom in &sibling.added {
                bullets.push(format!(
                    "{}{}",
                    escape(translate("additional_vs_winner", lang)),
                    describe_atom(atom, store, lang, cache)
                ));
            }
            for atom in &sibling.missing {
                bullets.push(format!(
                    "{}{}",
                    escape(translate("missing_vs_winner", lang)),
                    describe_atom(atom, store, lang, cache)
                ));
            }
            context! {
                code => escape(&sibling.code),
                text => escape(&sibling.text),
                bullets => bullets,
            }
        })
        .collect();

    let template = template_env()
        .get_template("explanation")
        .expect("explanation template registered");
    template
        .render(context! {
            code => escape(code),
            text => escape(text),
            verdict => escape(verdict),
            logic_header => escape(translate("prueflogik_header", lang)),
            condition_html => condition_html,
            comparison_header => escape(translate("comparison_header", lang)),
            no_differences => escape(translate("no_differences", lang)),
            siblings => sibling_ctx,
        })
        .unwrap_or_else(|err| format!("<p>render error: {}</p>", escape(&err.to_string())))
}
