//! Backend message translation.
//!
//! Rule engine and renderer emit German template instances; the response
//! edge translates them by matching a fixed pattern set and re-instantiating
//! the FR/IT template. Unknown patterns fall back to the German original.

use std::sync::OnceLock;

use regex::Regex;

use crate::catalog::types::Language;

/// Static translation lookup. Returns the key itself when unknown so the
/// renderer never panics on a missing entry.
pub fn translate(key: &str, lang: Language) -> &'static str {
    let (de, fr, it) = match key {
        "conditions_met" => (
            "(Bedingungen erfüllt)",
            "(Conditions remplies)",
            "(Condizioni soddisfatte)",
        ),
        "conditions_not_met" => (
            "(Bedingungen NICHT erfüllt)",
            "(Conditions NON remplies)",
            "(Condizioni NON soddisfatte)",
        ),
        "met" => ("Erfüllt", "Remplie", "Soddisfatta"),
        "not_met" => ("NICHT erfüllt", "NON remplie", "NON soddisfatta"),
        "prueflogik_header" => (
            "Prüflogik:",
            "Logique de vérification :",
            "Logica di verifica:",
        ),
        "group_logic" => (
            "Logik-Gruppe {id} (Alle Bedingungen dieser Gruppe müssen erfüllt sein):",
            "Groupe logique {id} (toutes les conditions de ce groupe doivent être remplies) :",
            "Gruppo logico {id} (tutte le condizioni di questo gruppo devono essere soddisfatte):",
        ),
        "no_valid_groups" => (
            "Keine gültigen Bedingungsgruppen gefunden.",
            "Aucun groupe de conditions valide trouvé.",
            "Nessun gruppo di condizioni valido trovato.",
        ),
        "no_conditions" => (
            "Keine spezifischen Bedingungen gefunden.",
            "Aucune condition spécifique trouvée.",
            "Nessuna condizione specifica trovata.",
        ),
        "require_lkn_list" => (
            "Erfordert LKN aus Liste: ",
            "Exige un LKN de la liste : ",
            "Richiede un LKN dalla lista: ",
        ),
        "require_lkn_table" => (
            "Erfordert LKN aus Tabelle: ",
            "Exige un LKN de la table : ",
            "Richiede un LKN dalla tabella: ",
        ),
        "require_icd_list" => (
            "Erfordert Diagnose aus Liste: ",
            "Exige un diagnostic de la liste : ",
            "Richiede una diagnosi dalla lista: ",
        ),
        "require_icd_table" => (
            "Erfordert Diagnose aus Tabelle: ",
            "Exige un diagnostic de la table : ",
            "Richiede una diagnosi dalla tabella: ",
        ),
        "require_medication_list" => (
            "Erfordert Medikament aus Liste: ",
            "Exige un médicament de la liste : ",
            "Richiede un medicamento dalla lista: ",
        ),
        "geschlecht_list" => (
            "Erfordert Geschlecht aus Liste: ",
            "Exige un sexe de la liste : ",
            "Richiede un sesso dalla lista: ",
        ),
        "patient_condition" => (
            "Patientenbedingung ({field}): {value}",
            "Condition patient ({field}) : {value}",
            "Condizione del paziente ({field}): {value}",
        ),
        "anzahl_condition" => (
            "Anzahl Prozeduren: {value}",
            "Nombre de procédures : {value}",
            "Numero di procedure: {value}",
        ),
        "seitigkeit_condition" => (
            "Seitigkeit: {value}",
            "Latéralité : {value}",
            "Lateralità: {value}",
        ),
        "entries_label" => ("Einträge", "entrées", "voci"),
        "additional_vs_winner" => (
            "Zusätzlich erforderlich: ",
            "Exigence supplémentaire : ",
            "Requisito aggiuntivo: ",
        ),
        "missing_vs_winner" => (
            "Nicht mehr erforderlich: ",
            "N'est plus exigé : ",
            "Non più richiesto: ",
        ),
        "comparison_header" => (
            "Vergleich mit verwandten Pauschalen:",
            "Comparaison avec les forfaits apparentés :",
            "Confronto con i forfait correlati:",
        ),
        "no_differences" => (
            "Keine Unterschiede in den Bedingungen.",
            "Aucune différence dans les conditions.",
            "Nessuna differenza nelle condizioni.",
        ),
        "rule_qty_exceeded" => (
            "Mengenbeschränkung überschritten (max. {max}, angefragt {req})",
            "Limite de quantité dépassée (max. {max}, demandé {req})",
            "Limite di quantità superato (max. {max}, richiesto {req})",
        ),
        "rule_qty_reduced" => (
            "Menge auf {value} reduziert (Mengenbeschränkung)",
            "Quantité réduite à {value} (limite de quantité)",
            "Quantità ridotta a {value} (limite di quantità)",
        ),
        "rule_only_supplement" => (
            "Nur als Zuschlag zu {codes} zulässig (Basis fehlt)",
            "Admis uniquement comme supplément à {codes} (position de base manquante)",
            "Ammesso solo come supplemento a {codes} (posizione di base mancante)",
        ),
        "rule_not_cumulable" => (
            "Nicht kumulierbar mit: {codes}",
            "Non cumulable avec : {codes}",
            "Non cumulabile con: {codes}",
        ),
        "rule_only_cumulable" => (
            "Nur kumulierbar mit: {codes}",
            "Cumulable uniquement avec : {codes}",
            "Cumulabile solo con: {codes}",
        ),
        "rule_patient_field_missing" => (
            "Patientenbedingung ({field}) nicht erfüllt: Kontextwert fehlt",
            "Condition patient ({field}) non remplie : valeur de contexte manquante",
            "Condizione del paziente ({field}) non soddisfatta: valore di contesto mancante",
        ),
        "rule_patient_age" => (
            "Patientenbedingung ({detail}) nicht erfüllt (Patient: {value})",
            "Condition patient ({detail}) non remplie (patient : {value})",
            "Condizione del paziente ({detail}) non soddisfatta (paziente: {value})",
        ),
        "rule_patient_gender_mismatch" => (
            "Patientenbedingung (Geschlecht): erwartet '{exp}', gefunden '{found}'",
            "Condition patient (sexe) : attendu '{exp}', trouvé '{found}'",
            "Condizione del paziente (sesso): atteso '{exp}', trovato '{found}'",
        ),
        "rule_patient_gender_invalid" => (
            "Patientenbedingung (Geschlecht): Ungültige Werte für Geschlechtsprüfung",
            "Condition patient (sexe) : valeurs invalides pour le contrôle du sexe",
            "Condizione del paziente (sesso): valori non validi per il controllo del sesso",
        ),
        "rule_patient_medication_missing" => (
            "Patientenbedingung (Medikamente): Erwartet einen von {required}, nicht gefunden",
            "Condition patient (médicaments) : un de {required} attendu, non trouvé",
            "Condizione del paziente (medicamenti): atteso uno di {required}, non trovato",
        ),
        "rule_diagnosis_missing" => (
            "Erforderliche Diagnose(n) nicht vorhanden (Benötigt: {codes})",
            "Diagnostic(s) requis absent(s) (requis : {codes})",
            "Diagnosi richiesta/e mancante/i (richiesto: {codes})",
        ),
        "rule_pauschale_exclusion" => (
            "Leistung nicht zulässig bei gleichzeitiger Abrechnung der Pauschale(n): {codes}",
            "Prestation non admise en cas de facturation simultanée du/des forfait(s) : {codes}",
            "Prestazione non ammessa in caso di fatturazione simultanea del/dei forfait: {codes}",
        ),
        "rule_internal_error" => (
            "Interner Fehler bei Regelprüfung: {error}",
            "Erreur interne lors du contrôle des règles : {error}",
            "Errore interno durante il controllo delle regole: {error}",
        ),
        "llm_no_lkn" => (
            "Keine LKN vom LLM identifiziert/validiert.",
            "Aucun LKN identifié/validé par le LLM.",
            "Nessun LKN identificato/convalidato dal LLM.",
        ),
        "no_billable_services" => (
            "Keine abrechenbaren TARDOC-Leistungen nach Regelprüfung gefunden.",
            "Aucune prestation TARDOC facturable trouvée après le contrôle des règles.",
            "Nessuna prestazione TARDOC fatturabile trovata dopo il controllo delle regole.",
        ),
        "no_package_candidates" => (
            "Keine potenziellen Pauschalen für die erbrachten Leistungen gefunden.",
            "Aucun forfait potentiel trouvé pour les prestations fournies.",
            "Nessun forfait potenziale trovato per le prestazioni fornite.",
        ),
        "no_package_applicable" => (
            "Keine der potenziellen Pauschalen erfüllt ihre Bedingungen.",
            "Aucun des forfaits potentiels ne remplit ses conditions.",
            "Nessuno dei forfait potenziali soddisfa le proprie condizioni.",
        ),
        _ => return "",
    };
    match lang {
        Language::De => de,
        Language::Fr => fr,
        Language::It => it,
    }
}

/// Instantiates a translation template with `{name}` placeholders.
pub fn translate_fmt(key: &str, lang: Language, params: &[(&str, &str)]) -> String {
    let template = translate(key, lang);
    let mut out = if template.is_empty() {
        key.to_string()
    } else {
        template.to_string()
    };
    for (name, value) in params {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

struct MessagePattern {
    regex: Regex,
    key: &'static str,
}

fn message_patterns() -> &'static [MessagePattern] {
    static PATTERNS: OnceLock<Vec<MessagePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let defs: [(&str, &str); 12] = [
            (
                r"^Mengenbeschränkung überschritten \(max\. (?P<max>\d+), angefragt (?P<req>\d+)\)$",
                "rule_qty_exceeded",
            ),
            (
                r"^Menge auf (?P<value>\d+) reduziert \(Mengenbeschränkung\)$",
                "rule_qty_reduced",
            ),
            (
                r"^Nur als Zuschlag zu (?P<codes>.+) zulässig \(Basis fehlt\)$",
                "rule_only_supplement",
            ),
            (r"^Nicht kumulierbar mit: (?P<codes>.+)$", "rule_not_cumulable"),
            (r"^Nur kumulierbar mit: (?P<codes>.+)$", "rule_only_cumulable"),
            (
                r"^Patientenbedingung \((?P<field>[^)]+)\) nicht erfüllt: Kontextwert fehlt$",
                "rule_patient_field_missing",
            ),
            (
                r"^Patientenbedingung \((?P<detail>.+)\) nicht erfüllt \(Patient: (?P<value>[^)]+)\)$",
                "rule_patient_age",
            ),
            (
                r"^Patientenbedingung \(Geschlecht\): erwartet '(?P<exp>[^']+)', gefunden '(?P<found>[^']+)'$",
                "rule_patient_gender_mismatch",
            ),
            (
                r"^Patientenbedingung \(Geschlecht\): Ungültige Werte für Geschlechtsprüfung$",
                "rule_patient_gender_invalid",
            ),
            (
                r"^Patientenbedingung \(Medikamente\): Erwartet einen von (?P<required>.+), nicht gefunden$",
                "rule_patient_medication_missing",
            ),
            (
                r"^Erforderliche Diagnose\(n\) nicht vorhanden \(Benötigt: (?P<codes>.+)\)$",
                "rule_diagnosis_missing",
            ),
            (
                r"^Leistung nicht zulässig bei gleichzeitiger Abrechnung der Pauschale\(n\): (?P<codes>.+)$",
                "rule_pauschale_exclusion",
            ),
        ];
        defs.iter()
            .map(|(pattern, key)| MessagePattern {
                regex: Regex::new(pattern).unwrap(),
                key,
            })
            .collect()
    })
}

/// Translates a German rule message into `lang` by pattern matching; returns
/// the original when German is requested or no pattern applies.
pub fn translate_rule_message(message: &str, lang: Language) -> String {
    if lang == Language::De || message.is_empty() {
        return message.to_string();
    }
    for pattern in message_patterns() {
        if let Some(caps) = pattern.regex.captures(message) {
            let mut params: Vec<(&str, &str)> = Vec::new();
            for name in pattern.regex.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    params.push((name, m.as_str()));
                }
            }
            return translate_fmt(pattern.key, lang, &params);
        }
    }
    message.to_string()
}
