//! Prompt templates for both LLM stages, one Stage-1 template per language.
//!
//! The Stage-1 prompts carry the hard quantity rules (consultation split,
//! time-based rounding, bilateral doubling) and the catalogue context as the
//! only source of valid codes. Stage-2 prompts are deliberately terse: the
//! selector validates every suggestion structurally anyway.

use std::sync::OnceLock;

use minijinja::{context, Environment};

use crate::catalog::types::Language;
use crate::error::Result;

const STAGE1_DE: &str = r#"**Aufgabe:** Analysiere den Behandlungstext und extrahiere die korrekten Leistungs-Katalog-Nummern (LKN) mit Menge. Antworte ausschliesslich mit einem validen JSON-Objekt, ohne Markdown.
{% if synonyms %}
**Wichtige Synonyme:** Die folgenden Begriffe sind funktional identisch zu behandeln: {{ synonyms | join(", ") }}.
{% endif %}
**ZWINGENDE REGELN (HÖCHSTE PRIORITÄT):**
1) Konsultation mit Gesamtdauer D > 5 Minuten ⇒ exakt 1× AA/CA.00.0010 und (D − 5)× AA/CA.00.0020.
2) .0010 niemals duplizieren; .0020 niemals durch eine andere LKN ersetzen.
3) Wird "Hausarzt" erwähnt ⇒ Kapitel CA.*, sonst AA.*.
4) Die Ausgabe muss 100 % der genannten Minuten abdecken.

**Kontext: Leistungskatalog** (einzige Quelle gültiger LKN, Beschreibungen und Typen):
--- Leistungskatalog Start ---
{{ katalog_context }}
--- Leistungskatalog Ende ---

**Vorgehen:**
1. Zerlege den Text in einzelne abrechenbare Tätigkeiten und ordne Zeitangaben der richtigen Tätigkeit zu.
2. Finde für jede Tätigkeit die LKN ausschliesslich im Katalog oben. Wörtlich genannte Codes im Format AA.NN.NNNN haben Vorrang, sofern sie im Kontext stehen.
3. Mengenregeln:
   - REGEL A (Konsultationen AA/CA): Basis .0010 immer Menge 1; Zusatz .0020 nur bei Dauer > 5 Min mit Menge (Dauer − 5).
   - REGEL B (andere zeitbasierte Leistungen): Menge = Dauer / Zeiteinheit, angebrochene Einheiten aufrunden.
   - REGEL C (Standard): Menge 1, ausser der Text nennt eine klare Anzahl. Bei "beidseits" Menge 2, wenn die LKN einseitig definiert ist.
4. Validiere jede LKN Zeichen für Zeichen gegen den Katalog; übernimm typ und beschreibung unverändert aus dem Katalog.
5. Extrahiere nur explizit genannte Kontextwerte (sonst null) und die seitigkeit ("links", "rechts", "beidseits", sonst "unbekannt").

**Output-Format (NUR dieses JSON-Objekt):**
{"identified_leistungen":[{"lkn":"...","typ":"...","menge":1}],"extracted_info":{"dauer_minuten":null,"menge_allgemein":null,"alter":null,"geschlecht":null,"seitigkeit":"unbekannt","anzahl_prozeduren":null},"begruendung_llm":"..."}

Behandlungstext: "{{ user_input }}"

JSON-Antwort:"#;

const STAGE1_FR: &str = r#"**Tâche :** Analysez le texte de traitement et extrayez les numéros de catalogue de prestations (LKN) corrects avec leur quantité. Répondez exclusivement par un objet JSON valide, sans Markdown.
{% if synonyms %}
**Synonymes importants :** Les termes suivants sont fonctionnellement identiques : {{ synonyms | join(", ") }}.
{% endif %}
**CONTRAINTES NON NÉGOCIABLES (PRIORITÉ MAXIMALE) :**
1) Consultation d'une durée totale D > 5 min ⇒ exactement 1× AA/CA.00.0010 et (D − 5)× AA/CA.00.0020.
2) Ne jamais dupliquer .0010 ; ne jamais remplacer .0020 par un autre LKN.
3) Si "médecin de famille" est mentionné ⇒ chapitre CA.*, sinon AA.*.
4) La sortie doit couvrir 100 % des minutes déclarées.

**Contexte : catalogue des prestations** (seule source de LKN valides, descriptions et types) :
--- Leistungskatalog Start ---
{{ katalog_context }}
--- Leistungskatalog Ende ---

**Procédure :**
1. Décomposez le texte en activités facturables et associez les durées à la bonne activité.
2. Cherchez chaque LKN uniquement dans le catalogue ci-dessus. Un code cité mot à mot (format AA.NN.NNNN) est prioritaire s'il existe dans le contexte.
3. Règles de quantité :
   - RÈGLE A (consultations AA/CA) : base .0010 toujours quantité 1 ; supplément .0020 seulement si durée > 5 min, quantité (durée − 5).
   - RÈGLE B (autres prestations temporelles) : quantité = durée / unité, minutes entamées arrondies vers le haut.
   - RÈGLE C (défaut) : quantité 1, sauf nombre explicite dans le texte. Pour "bilatéral", quantité 2 si le LKN est défini unilatéral.
4. Validez chaque LKN caractère par caractère contre le catalogue ; reprenez typ et beschreibung à l'identique.
5. Extrayez uniquement les valeurs de contexte explicites (sinon null) et la seitigkeit ("links", "rechts", "beidseits", sinon "unbekannt").

**Format de sortie (UNIQUEMENT cet objet JSON) :**
{"identified_leistungen":[{"lkn":"...","typ":"...","menge":1}],"extracted_info":{"dauer_minuten":null,"menge_allgemein":null,"alter":null,"geschlecht":null,"seitigkeit":"unbekannt","anzahl_prozeduren":null},"begruendung_llm":"..."}

Texte de traitement : "{{ user_input }}"

Réponse JSON :"#;

const STAGE1_IT: &str = r#"**Compito:** Analizza il testo di trattamento ed estrai i numeri di catalogo delle prestazioni (LKN) corretti con la quantità. Rispondi esclusivamente con un oggetto JSON valido, senza Markdown.
{% if synonyms %}
**Sinonimi importanti:** I seguenti termini sono funzionalmente identici: {{ synonyms | join(", ") }}.
{% endif %}
**VINCOLI NON NEGOZIABILI (PRIORITÀ MASSIMA):**
1) Consultazione con durata totale D > 5 min ⇒ esattamente 1× AA/CA.00.0010 e (D − 5)× AA/CA.00.0020.
2) Mai duplicare .0010; mai sostituire .0020 con un altro LKN.
3) Se è menzionato "medico di base" ⇒ capitolo CA.*, altrimenti AA.*.
4) L'output deve coprire il 100 % dei minuti dichiarati.

**Contesto: catalogo delle prestazioni** (unica fonte di LKN validi, descrizioni e tipi):
--- Leistungskatalog Start ---
{{ katalog_context }}
--- Leistungskatalog Ende ---

**Procedura:**
1. Scomponi il testo in attività fatturabili e associa le durate all'attività giusta.
2. Cerca ogni LKN solo nel catalogo sopra. Un codice citato letteralmente (formato AA.NN.NNNN) ha priorità se esiste nel contesto.
3. Regole di quantità:
   - REGOLA A (consultazioni AA/CA): base .0010 sempre quantità 1; supplemento .0020 solo se durata > 5 min, quantità (durata − 5).
   - REGOLA B (altre prestazioni a tempo): quantità = durata / unità, minuti iniziati arrotondati per eccesso.
   - REGOLA C (predefinita): quantità 1, salvo numero esplicito nel testo. Per "bilaterale", quantità 2 se il LKN è definito unilaterale.
4. Convalida ogni LKN carattere per carattere contro il catalogo; riprendi typ e beschreibung senza modifiche.
5. Estrai solo valori di contesto espliciti (altrimenti null) e la seitigkeit ("links", "rechts", "beidseits", altrimenti "unbekannt").

**Formato di output (SOLO questo oggetto JSON):**
{"identified_leistungen":[{"lkn":"...","typ":"...","menge":1}],"extracted_info":{"dauer_minuten":null,"menge_allgemein":null,"alter":null,"geschlecht":null,"seitigkeit":"unbekannt","anzahl_prozeduren":null},"begruendung_llm":"..."}

Testo di trattamento: "{{ user_input }}"

Risposta JSON:"#;

const STAGE2_MAPPING: &str = r#"**Aufgabe:** Du bist Experte für die Schweizer Arzttarife (TARDOC und Pauschalen). Finde für die gegebene TARDOC-Einzelleistung (Typ E/EZ) die funktional äquivalente Leistung aus der Kandidatenliste.

**Gegebene TARDOC-Leistung:**
*   LKN: {{ tardoc_lkn }}
*   Beschreibung: {{ tardoc_desc }}

**Mögliche Äquivalente (LKNs aus Pauschalen-Bedingungen):**
--- Kandidaten Start ---
{{ candidates }}
--- Kandidaten Ende ---

**Entscheidung:** Verstehe die medizinische Kernfunktion der TARDOC-Leistung (z.B. Anästhesie, Bildgebung) und wähle die Kandidaten, die dieselbe Tätigkeit beschreiben, die spezifischste zuerst.

**Antwort:** Gib eine reine, kommagetrennte Liste der passenden LKN-Codes zurück (z.B. `WA.10.0010,WA.10.0020`). Wenn kein Kandidat passt, gib exakt das Wort `NONE` zurück. Kein anderer Text, kein Markdown.

Priorisierte Kandidaten-LKNs:"#;

const STAGE2_RANKING: &str = r#"Basierend auf dem folgenden Behandlungstext, welche der aufgeführten Pauschalen passt inhaltlich am besten? Berücksichtige die Beschreibung der Pauschale.
Gib NUR die Pauschalen-Codes als kommagetrennte Liste zurück, beste Übereinstimmung zuerst (z.B. "CODE1,CODE2"). Wenn keine passt, gib `NONE` zurück. Keine Begründung.

Behandlungstext: "{{ user_input }}"

Potenzielle Pauschalen:
--- Pauschalen Start ---
{{ pauschalen }}
--- Pauschalen Ende ---

Priorisierte Pauschalen-Codes:"#;

fn environment() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.add_template("stage1_de", STAGE1_DE).expect("stage1_de");
        env.add_template("stage1_fr", STAGE1_FR).expect("stage1_fr");
        env.add_template("stage1_it", STAGE1_IT).expect("stage1_it");
        env.add_template("mapping", STAGE2_MAPPING).expect("mapping");
        env.add_template("ranking", STAGE2_RANKING).expect("ranking");
        env
    })
}

/// Renders the Stage-1 identification prompt in the request language.
pub fn stage1_prompt(
    user_input: &str,
    katalog_context: &str,
    lang: Language,
    synonyms: &[String],
) -> Result<String> {
    let name = match lang {
        Language::De => "stage1_de",
        Language::Fr => "stage1_fr",
        Language::It => "stage1_it",
    };
    let template = environment().get_template(name)?;
    Ok(template.render(context! {
        user_input => user_input,
        katalog_context => katalog_context,
        synonyms => synonyms,
    })?)
}

/// Renders the Stage-2 mapping prompt (TARDOC → package-condition code).
pub fn mapping_prompt(
    tardoc_lkn: &str,
    tardoc_desc: &str,
    candidates: &[(String, String)],
) -> Result<String> {
    let candidates_text = candidates
        .iter()
        .map(|(code, desc)| format!("- {code}: {desc}"))
        .collect::<Vec<_>>()
        .join("\n");
    // Keep the candidate block inside a sane context budget.
    let candidates_text = if candidates_text.len() > 15_000 {
        let mut truncated: String = candidates_text.chars().take(15_000).collect();
        truncated.push_str("\n...");
        truncated
    } else {
        candidates_text
    };
    let template = environment().get_template("mapping")?;
    Ok(template.render(context! {
        tardoc_lkn => tardoc_lkn,
        tardoc_desc => tardoc_desc,
        candidates => candidates_text,
    })?)
}

/// Renders the Stage-2 package ranking prompt.
pub fn ranking_prompt(user_input: &str, pauschalen: &[(String, String)]) -> Result<String> {
    let pauschalen_text = pauschalen
        .iter()
        .map(|(code, text)| format!("- {code}: {text}"))
        .collect::<Vec<_>>()
        .join("\n");
    let template = environment().get_template("ranking")?;
    Ok(template.render(context! {
        user_input => user_input,
        pauschalen => pauschalen_text,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage1_prompt_embeds_context_and_rules() {
        let prompt = stage1_prompt(
            "Hausarztkonsultation 10 Minuten",
            "LKN: CA.00.0010, Typ: E, Beschreibung: Konsultation",
            Language::De,
            &[],
        )
        .unwrap();
        assert!(prompt.contains("CA.00.0010"));
        assert!(prompt.contains("Hausarztkonsultation 10 Minuten"));
        assert!(prompt.contains("(D − 5)× AA/CA.00.0020"));
        assert!(!prompt.contains("Synonyme:"));
    }

    #[test]
    fn stage1_prompt_lists_synonyms_when_present() {
        let prompt = stage1_prompt(
            "Warzenentfernung",
            "LKN: X",
            Language::De,
            &["Warze".to_string(), "Verruca".to_string()],
        )
        .unwrap();
        assert!(prompt.contains("Warze, Verruca"));
    }

    #[test]
    fn stage1_prompt_localises() {
        let fr = stage1_prompt("texte", "ctx", Language::Fr, &[]).unwrap();
        assert!(fr.contains("médecin de famille"));
        let it = stage1_prompt("testo", "ctx", Language::It, &[]).unwrap();
        assert!(it.contains("medico di base"));
    }

    #[test]
    fn mapping_prompt_truncates_oversized_candidate_lists() {
        let candidates: Vec<(String, String)> = (0..2000)
            .map(|i| (format!("WA.10.{i:04}"), "Anästhesie mit langer Beschreibung".into()))
            .collect();
        let prompt = mapping_prompt("AG.00.0030", "Anästhesie", &candidates).unwrap();
        assert!(prompt.contains("..."));
        assert!(prompt.len() < 20_000);
    }

    #[test]
    fn ranking_prompt_lists_packages() {
        let prompt = ranking_prompt(
            "Bronchoskopie",
            &[("C03.26A".into(), "Bronchoskopie-Pauschale".into())],
        )
        .unwrap();
        assert!(prompt.contains("C03.26A"));
        assert!(prompt.contains("NONE"));
    }
}
