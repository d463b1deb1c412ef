//! Pure construction of per-target documents from a record's slots.
//!
//! Slots are applied oldest-first so that, for any destination key written by
//! several sources, the most recently updated source wins. A fixed set of
//! overrides is applied afterwards for fields where one source always takes
//! precedence regardless of recency.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{Document, Record, Slot, Target};

/// Tunables for the Solr-only post-merge fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_doctype_ranking")]
    pub doctype_ranking: BTreeMap<String, u32>,
    #[serde(default = "default_has_fields")]
    pub has_fields: Vec<String>,
    #[serde(default = "default_enable_has")]
    pub enable_has: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            doctype_ranking: default_doctype_ranking(),
            has_fields: default_has_fields(),
            enable_has: default_enable_has(),
        }
    }
}

fn default_enable_has() -> bool {
    true
}

fn default_has_fields() -> Vec<String> {
    [
        "abstract",
        "ack",
        "aff",
        "aff_id",
        "author",
        "bibgroup",
        "body",
        "citation_count",
        "comment",
        "database",
        "doctype",
        "doi",
        "first_author",
        "identifier",
        "institution",
        "issue",
        "keyword",
        "orcid_other",
        "orcid_pub",
        "orcid_user",
        "origin",
        "property",
        "pub",
        "pub_raw",
        "publisher",
        "references",
        "title",
        "uat",
        "volume",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_doctype_ranking() -> BTreeMap<String, u32> {
    [
        ("article", 1),
        ("eprint", 1),
        ("inproceedings", 2),
        ("inbook", 1),
        ("abstract", 4),
        ("book", 1),
        ("bookreview", 4),
        ("catalog", 2),
        ("circular", 3),
        ("erratum", 6),
        ("mastersthesis", 3),
        ("newsletter", 5),
        ("obituary", 6),
        ("phdthesis", 3),
        ("pressrelease", 7),
        ("proceedings", 3),
        ("proposal", 4),
        ("software", 2),
        ("talk", 4),
        ("techreport", 3),
        ("misc", 8),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// A malformed value found while deriving a field. The derivation is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataIssue {
    pub bibcode: String,
    pub field: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub document: Document,
    pub issues: Vec<DataIssue>,
}

struct Scope<'a> {
    bibcode: &'a str,
    issues: Vec<DataIssue>,
}

impl Scope<'_> {
    fn issue(&mut self, field: &'static str, detail: impl Into<String>) {
        self.issues.push(DataIssue {
            bibcode: self.bibcode.to_string(),
            field,
            detail: detail.into(),
        });
    }
}

type Derive = fn(&JsonValue, &Document, &mut Scope<'_>) -> Document;

enum Rule {
    /// Shallow-merge the whole payload into the document.
    Extend,
    /// Store the payload verbatim under a key.
    Key(&'static str),
    /// Compute fields from the payload and the document built so far.
    Derive(Derive),
}

#[derive(Clone, Copy)]
enum Input {
    Slot(Slot),
    RowId,
    Timestamps,
}

struct Step {
    input: Input,
    rule: Rule,
}

const SOLR_STEPS: &[Step] = &[
    Step { input: Input::Slot(Slot::BibData), rule: Rule::Extend },
    Step { input: Input::Slot(Slot::OrcidClaims), rule: Rule::Derive(orcid_claims) },
    Step { input: Input::Slot(Slot::NonBibData), rule: Rule::Derive(nonbib_fields) },
    Step { input: Input::Slot(Slot::Metrics), rule: Rule::Derive(citation_list) },
    Step { input: Input::RowId, rule: Rule::Key("id") },
    Step { input: Input::Slot(Slot::Fulltext), rule: Rule::Derive(fulltext_fields) },
    Step { input: Input::Timestamps, rule: Rule::Extend },
    Step { input: Input::Slot(Slot::Augments), rule: Rule::Derive(affiliation_augments) },
];

const METRICS_STEPS: &[Step] = &[Step {
    input: Input::Slot(Slot::Metrics),
    rule: Rule::Derive(metrics_columns),
}];

const LINKS_STEPS: &[Step] = &[
    Step { input: Input::Slot(Slot::BibData), rule: Rule::Derive(bib_link_rows) },
    Step { input: Input::Slot(Slot::NonBibData), rule: Rule::Derive(nonbib_link_rows) },
];

/// Columns of the metrics table taken from the metrics slot.
pub const METRICS_COLUMNS: &[&str] = &[
    "refereed",
    "rn_citations",
    "rn_citation_data",
    "downloads",
    "reads",
    "an_citations",
    "refereed_citation_num",
    "citation_num",
    "reference_num",
    "citations",
    "refereed_citations",
    "author_num",
    "an_refereed_citations",
];

const OPEN_ACCESS_PROPERTIES: &[&str] = &[
    "ESOURCE",
    "ARTICLE",
    "NOT REFEREED",
    "EPRINT_OPENACCESS",
    "OPENACCESS",
];
const OPEN_ACCESS_ESOURCES: &[&str] = &["EPRINT_HTML", "EPRINT_PDF"];

/// Builds candidate documents. Holds only configuration; never touches I/O.
#[derive(Debug, Clone)]
pub struct DocumentMerger {
    config: MergeConfig,
    doctype_scores: BTreeMap<String, f64>,
    has_fields: Vec<String>,
}

impl Default for DocumentMerger {
    fn default() -> Self {
        Self::new(MergeConfig::default())
    }
}

impl DocumentMerger {
    pub fn new(config: MergeConfig) -> Self {
        let doctype_scores = doctype_scores(&config.doctype_ranking);
        let mut has_fields = config.has_fields.clone();
        has_fields.sort();
        has_fields.dedup();
        Self {
            config,
            doctype_scores,
            has_fields,
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn candidate(&self, record: &Record, target: Target) -> Merged {
        match target {
            Target::Solr => self.solr_document(record),
            Target::Metrics => self.metrics_document(record),
            Target::Links => self.links_document(record),
        }
    }

    pub fn solr_document(&self, record: &Record) -> Merged {
        let mut scope = Scope {
            bibcode: &record.bibcode,
            issues: Vec::new(),
        };
        let mut out = apply_steps(record, SOLR_STEPS, &mut scope);

        let bib = record.slot(Slot::BibData).payload();
        let nonbib = record.slot(Slot::NonBibData).payload();

        if let (Some(bib), Some(nonbib)) = (bib, nonbib) {
            let bib_links = bib.get("links_data").filter(|v| truthy(v));
            let nonbib_links = nonbib.get("links_data").filter(|v| truthy(v));
            if let (Some(_), Some(rows)) = (bib_links, nonbib_links) {
                out.insert("links_data".into(), rows.clone());
            }
        }

        if let Some(nonbib) = nonbib {
            for key in ["bibgroup", "bibgroup_facet"] {
                if let Some(value) = nonbib.get(key).filter(|v| truthy(v)) {
                    out.insert(key.into(), value.clone());
                }
            }
        }

        if nonbib.is_none() {
            if let Some(links) = bib.and_then(|b| b.get("links_data")).filter(|v| truthy(v)) {
                legacy_open_access(links, &mut out, &mut scope);
            }
        }

        let boost = out
            .get("doctype")
            .and_then(JsonValue::as_str)
            .and_then(|doctype| self.doctype_scores.get(doctype))
            .map_or(JsonValue::Null, |score| json!(score));
        out.insert("doctype_boost".into(), boost);

        if self.config.enable_has {
            let has = self
                .has_fields
                .iter()
                .filter(|field| out.get(field.as_str()).is_some_and(has_content))
                .map(|field| JsonValue::String(field.clone()))
                .collect::<Vec<_>>();
            out.insert("has".into(), JsonValue::Array(has));
        }

        Merged {
            document: out,
            issues: scope.issues,
        }
    }

    pub fn metrics_document(&self, record: &Record) -> Merged {
        let mut scope = Scope {
            bibcode: &record.bibcode,
            issues: Vec::new(),
        };
        let mut out = apply_steps(record, METRICS_STEPS, &mut scope);
        out.insert("bibcode".into(), JsonValue::String(record.bibcode.clone()));
        Merged {
            document: out,
            issues: scope.issues,
        }
    }

    pub fn links_document(&self, record: &Record) -> Merged {
        let mut scope = Scope {
            bibcode: &record.bibcode,
            issues: Vec::new(),
        };
        let mut out = apply_steps(record, LINKS_STEPS, &mut scope);

        // Rows curated by the non-bib pipeline win over anything derived from bib data.
        if let Some(rows) = record
            .slot(Slot::NonBibData)
            .payload()
            .and_then(|p| p.get("data_links_rows"))
            .filter(|v| truthy(v))
        {
            out.insert("data_links_rows".into(), rows.clone());
        }
        out.insert("bibcode".into(), JsonValue::String(record.bibcode.clone()));
        Merged {
            document: out,
            issues: scope.issues,
        }
    }
}

fn apply_steps(record: &Record, steps: &[Step], scope: &mut Scope<'_>) -> Document {
    let mut ordered = steps
        .iter()
        .map(|step| (step, input_timestamp(record, step.input)))
        .collect::<Vec<_>>();
    // Stable: equal keys keep declaration order; untimed inputs go last.
    ordered.sort_by_key(|(_, ts)| (ts.is_none(), *ts));

    let mut out = Document::new();
    out.insert("bibcode".into(), JsonValue::String(record.bibcode.clone()));

    for (step, _) in ordered {
        let Some(payload) = input_payload(record, step.input) else {
            continue;
        };
        match &step.rule {
            Rule::Extend => match payload {
                JsonValue::Object(map) => {
                    for (k, v) in map {
                        out.insert(k, v);
                    }
                }
                other => scope.issue(input_name(step.input), format!("expected an object, got {other}")),
            },
            Rule::Key(key) => {
                out.insert((*key).to_string(), payload);
            }
            Rule::Derive(derive) => {
                let fields = derive(&payload, &out, scope);
                out.extend(fields);
            }
        }
    }
    out
}

fn input_timestamp(record: &Record, input: Input) -> Option<DateTime<Utc>> {
    match input {
        Input::Slot(slot) => record.slot(slot).updated,
        Input::RowId | Input::Timestamps => None,
    }
}

fn input_payload(record: &Record, input: Input) -> Option<JsonValue> {
    match input {
        Input::Slot(slot) => record.slot(slot).payload().filter(|v| truthy(v)).cloned(),
        Input::RowId => Some(json!(record.id)),
        Input::Timestamps => Some(JsonValue::Object(timestamp_summary(record))),
    }
}

fn input_name(input: Input) -> &'static str {
    match input {
        Input::Slot(slot) => slot.as_str(),
        Input::RowId => "id",
        Input::Timestamps => "timestamps",
    }
}

/// Solr timestamp format, microsecond precision.
pub fn solr_stamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Per-source modification stamps plus the latest of them.
pub fn timestamp_summary(record: &Record) -> Document {
    const FIELDS: &[(&str, Slot)] = &[
        ("metadata_mtime", Slot::BibData),
        ("nonbib_mtime", Slot::NonBibData),
        ("fulltext_mtime", Slot::Fulltext),
        ("orcid_mtime", Slot::OrcidClaims),
        ("metrics_mtime", Slot::Metrics),
    ];
    let mut out = Document::new();
    let mut latest: Option<DateTime<Utc>> = None;
    for (field, slot) in FIELDS {
        if let Some(t) = record.slot(*slot).updated {
            out.insert((*field).to_string(), JsonValue::String(solr_stamp(t)));
            latest = Some(latest.map_or(t, |l| l.max(t)));
        }
    }
    if let Some(t) = latest {
        out.insert("update_timestamp".into(), JsonValue::String(solr_stamp(t)));
    }
    out
}

fn orcid_claims(data: &JsonValue, _doc: &Document, _scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    if let Some(verified) = data.get("verified") {
        out.insert("orcid_user".into(), verified.clone());
    }
    if let Some(unverified) = data.get("unverified") {
        out.insert("orcid_other".into(), unverified.clone());
    }
    out
}

fn citation_list(data: &JsonValue, _doc: &Document, _scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    out.insert("citation".into(), field_or(data, "citations", json!([])));
    out
}

fn fulltext_fields(data: &JsonValue, _doc: &Document, scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    match data {
        JsonValue::String(body) => {
            out.insert("body".into(), JsonValue::String(body.clone()));
        }
        JsonValue::Object(map) => {
            for (from, to) in [("body", "body"), ("acknowledgements", "ack"), ("facility", "facility")] {
                if let Some(value) = map.get(from) {
                    out.insert(to.into(), value.clone());
                }
            }
        }
        other => scope.issue("fulltext", format!("unexpected fulltext payload {other}")),
    }
    out
}

fn affiliation_augments(data: &JsonValue, doc: &Document, _scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    let Some(map) = data.as_object().filter(|m| !m.is_empty()) else {
        return out;
    };
    // `aff` prefers the augment pipeline's raw strings over whatever bib data supplied.
    let aff = map
        .get("aff_raw")
        .or_else(|| map.get("aff"))
        .or_else(|| doc.get("aff"))
        .cloned()
        .unwrap_or(JsonValue::Null);
    out.insert("aff".into(), aff);
    for key in [
        "aff_abbrev",
        "aff_canonical",
        "aff_facet",
        "aff_facet_hier",
        "aff_id",
        "institution",
    ] {
        out.insert(key.into(), map.get(key).cloned().unwrap_or(JsonValue::Null));
    }
    out
}

fn metrics_columns(data: &JsonValue, _doc: &Document, scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    let Some(map) = data.as_object() else {
        scope.issue("metrics", format!("expected an object, got {data}"));
        return out;
    };
    for column in METRICS_COLUMNS {
        if let Some(value) = map.get(*column) {
            out.insert((*column).to_string(), value.clone());
        }
    }
    out
}

fn nonbib_link_rows(data: &JsonValue, _doc: &Document, _scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    if let Some(rows) = data.get("data_links_rows").filter(|v| truthy(v)) {
        out.insert("data_links_rows".into(), rows.clone());
    }
    out
}

/// Synthesizes link rows from the bib pipeline's embedded `links_data` entries.
fn bib_link_rows(data: &JsonValue, _doc: &Document, scope: &mut Scope<'_>) -> Document {
    let mut out = Document::new();
    let Some(links) = data.get("links_data").filter(|v| truthy(v)) else {
        return out;
    };
    let Some(entries) = links.as_array() else {
        scope.issue("links_data", format!("expected a list, got {links}"));
        return out;
    };
    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            JsonValue::Object(_) => rows.push(entry.clone()),
            JsonValue::String(text) => match serde_json::from_str::<JsonValue>(text) {
                Ok(row @ JsonValue::Object(_)) => rows.push(row),
                _ => scope.issue("links_data", format!("unparsable link entry {text:?}")),
            },
            other => scope.issue("links_data", format!("unexpected link entry {other}")),
        }
    }
    if !rows.is_empty() {
        out.insert("data_links_rows".into(), JsonValue::Array(rows));
    }
    out
}

fn legacy_open_access(links: &JsonValue, out: &mut Document, scope: &mut Scope<'_>) {
    let parsed = links
        .as_array()
        .and_then(|items| items.first())
        .and_then(JsonValue::as_str)
        .and_then(|text| serde_json::from_str::<JsonValue>(text).ok())
        .filter(JsonValue::is_object);
    let Some(info) = parsed else {
        scope.issue("links_data", format!("invalid legacy link value {links}"));
        return;
    };

    let property = out
        .entry("property")
        .or_insert_with(|| JsonValue::Array(Vec::new()));
    if info.get("access").and_then(JsonValue::as_str) != Some("open") {
        return;
    }
    let Some(property) = property.as_array_mut() else {
        scope.issue("property", "property is not a list");
        return;
    };
    property.extend(OPEN_ACCESS_PROPERTIES.iter().map(|p| json!(p)));

    let esources = out
        .entry("esources")
        .or_insert_with(|| JsonValue::Array(Vec::new()));
    match esources.as_array_mut() {
        Some(esources) => esources.extend(OPEN_ACCESS_ESOURCES.iter().map(|e| json!(e))),
        None => scope.issue("esources", "esources is not a list"),
    }
}

fn nonbib_fields(data: &JsonValue, _doc: &Document, scope: &mut Scope<'_>) -> Document {
    let reader = field_or(data, "readers", json!([]));
    let read_count = reader.as_array().map_or(0, Vec::len);

    let mut grant = Vec::new();
    let mut grant_facet_hier = Vec::new();
    for entry in strings(data, "grants", scope) {
        match entry.split_once(' ') {
            Some((agency, number)) => {
                grant.push(agency.to_string());
                grant.push(number.to_string());
                grant_facet_hier.extend(hier_facet(&[agency, number]));
            }
            None => scope.issue("grants", format!("grant without agency/number: {entry:?}")),
        }
    }

    let mut planetary_feature = Vec::new();
    let mut planetary_feature_id = Vec::new();
    let mut planetary_2level = Vec::new();
    let mut planetary_3level = Vec::new();
    for entry in strings(data, "planetary_feature", scope) {
        let parts = entry.splitn(4, '/').collect::<Vec<_>>();
        let [planet, feature, name, id] = parts[..] else {
            scope.issue("planetary_feature", format!("expected planet/feature/name/id: {entry:?}"));
            continue;
        };
        planetary_feature.push(format!("{planet}/{feature}/{name}"));
        planetary_feature_id.push(id.to_string());
        planetary_3level.extend(hier_facet(&[planet, feature, name]));
        let label = if GROUPED_FEATURES.contains(&feature.to_lowercase().as_str()) {
            format!("{feature} {name}")
        } else {
            name.to_string()
        };
        planetary_2level.extend(hier_facet(&[planet, label.as_str()]));
    }

    let mut uat = Vec::new();
    let mut uat_id = Vec::new();
    let mut uat_facet_hier = Vec::new();
    for entry in strings(data, "uat", scope) {
        let mut parts = entry.split('/').collect::<Vec<_>>();
        let id = parts.pop().unwrap_or_default();
        uat.push(parts.join("/"));
        uat_id.push(id.to_string());
        uat_facet_hier.extend(hier_facet(&parts));
    }

    let mut simbid = Vec::new();
    let mut simbtype = Vec::new();
    let mut simbad_facet = Vec::new();
    for entry in strings(data, "simbad_objects", scope) {
        let (id, otype) = split_object(&entry, "simbad_objects", scope);
        let class = simbad_class(otype);
        simbid.push(id.to_string());
        simbtype.push(class.to_string());
        simbad_facet.extend(hier_facet(&[class, id]));
    }

    let mut nedid = Vec::new();
    let mut nedtype = Vec::new();
    let mut ned_facet = Vec::new();
    for entry in strings(data, "ned_objects", scope) {
        let (id, otype) = split_object(&entry, "ned_objects", scope);
        let class = ned_class(otype);
        nedid.push(id.to_string());
        nedtype.push(class.to_string());
        ned_facet.extend(hier_facet(&[class, id]));
    }

    let data_values = strings(data, "data", scope);
    let data_facet = data_values
        .iter()
        .map(|d| d.split(':').next().unwrap_or_default().to_string())
        .collect::<Vec<_>>();

    let mut out = Document::new();
    out.insert("reader".into(), reader);
    out.insert("read_count".into(), json!(read_count));
    out.insert("cite_read_boost".into(), field_or(data, "boost", json!(0.0)));
    out.insert("classic_factor".into(), field_or(data, "norm_cites", json!(0.0)));
    out.insert("reference".into(), field_or(data, "reference", json!([])));
    out.insert("data".into(), json!(data_values));
    out.insert("data_facet".into(), json!(data_facet));
    out.insert("esources".into(), field_or(data, "esource", json!([])));
    out.insert("property".into(), field_or(data, "property", json!([])));
    out.insert("planetary_feature".into(), json!(planetary_feature));
    out.insert("planetary_feature_id".into(), json!(planetary_feature_id));
    out.insert("planetary_feature_facet_hier_2level".into(), json!(planetary_2level));
    out.insert("planetary_feature_facet_hier_3level".into(), json!(planetary_3level));
    out.insert("uat".into(), json!(uat));
    out.insert("uat_id".into(), json!(uat_id));
    out.insert("uat_facet_hier".into(), json!(uat_facet_hier));
    out.insert("grant".into(), json!(grant));
    out.insert("grant_facet_hier".into(), json!(grant_facet_hier));
    out.insert("simbid".into(), json!(simbid));
    out.insert("simbtype".into(), json!(simbtype));
    out.insert("simbad_object_facet_hier".into(), json!(simbad_facet));
    out.insert("nedid".into(), json!(nedid));
    out.insert("nedtype".into(), json!(nedtype));
    out.insert("ned_object_facet_hier".into(), json!(ned_facet));
    out.insert("citation_count".into(), field_or(data, "citation_count", json!(0)));
    out.insert("citation_count_norm".into(), field_or(data, "citation_count_norm", json!(0)));
    if let Some(links) = data.get("links_data").filter(|v| truthy(v)) {
        out.insert("links_data".into(), links.clone());
    }
    out
}

const GROUPED_FEATURES: &[&str] = &[
    "albedo feature",
    "crater",
    "eruptive center",
    "landing site name",
    "large ringed feature",
    "lobus",
    "plume",
    "satellite feature",
];

/// `["a", "b"]` -> `["0/a", "1/a/b"]`.
pub fn hier_facet(levels: &[&str]) -> Vec<String> {
    (0..levels.len())
        .map(|i| format!("{i}/{}", levels[..=i].join("/")))
        .collect()
}

/// Coarse search class for a SIMBAD object type.
pub fn simbad_class(otype: &str) -> &'static str {
    if otype.starts_with('G') || otype.ends_with('G') {
        "Galaxy"
    } else if otype == "Star" || otype.contains('*') {
        "Star"
    } else if otype == "Neb" || otype.starts_with("PN") || otype.starts_with("SNR") {
        "Nebula"
    } else if otype == "HII" {
        "HII Region"
    } else if otype == "X" {
        "X-ray"
    } else if otype.starts_with("Radio") || otype == "Maser" || otype == "HI" {
        "Radio"
    } else if otype == "IR" || otype.starts_with("Red") {
        "Infrared"
    } else if otype == "UV" {
        "UV"
    } else {
        "Other"
    }
}

/// Coarse search class for a NED object type.
pub fn ned_class(otype: &str) -> &'static str {
    if otype.starts_with('!') {
        return "Galactic Object";
    }
    if otype.starts_with('*') {
        return "Star";
    }
    if otype.starts_with("Uv") {
        return "UV";
    }
    if otype.starts_with("Radio") {
        return "Radio";
    }
    match otype {
        "G" | "GClstr" | "GGroup" | "GPair" | "GTrpl" | "G_Lens" | "PofG" => "Galaxy",
        "Neb" | "PN" | "RfN" => "Nebula",
        "HII" => "HII Region",
        "X" => "X-ray",
        "Maser" | "HI" => "Radio",
        "IrS" => "Infrared",
        "Blue*" | "C*" | "exG*" | "Flare*" | "Nova" | "Psr" | "Red*" | "SN" | "SNR" | "V*"
        | "VisS" | "WD*" | "WR*" => "Star",
        _ => "Other",
    }
}

fn split_object<'a>(entry: &'a str, field: &'static str, scope: &mut Scope<'_>) -> (&'a str, &'a str) {
    match entry.split_once(' ') {
        Some(pair) => pair,
        None => {
            scope.issue(field, format!("object without a type: {entry:?}"));
            (entry, "")
        }
    }
}

fn strings(data: &JsonValue, key: &'static str, scope: &mut Scope<'_>) -> Vec<String> {
    let Some(value) = data.get(key).filter(|v| !v.is_null()) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        scope.issue(key, format!("expected a list, got {value}"));
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            Some(s) => out.push(s.to_string()),
            None => scope.issue(key, format!("non-string entry {item}")),
        }
    }
    out
}

fn field_or(data: &JsonValue, key: &str, default: JsonValue) -> JsonValue {
    data.get(key).cloned().unwrap_or(default)
}

/// Lowest rank scores 1.0, highest 0.0, evenly spaced across distinct ranks.
fn doctype_scores(ranking: &BTreeMap<String, u32>) -> BTreeMap<String, f64> {
    let mut ranks = ranking.values().copied().collect::<Vec<_>>();
    ranks.sort_unstable();
    ranks.dedup();
    let steps = ranks.len().saturating_sub(1);
    ranking
        .iter()
        .filter_map(|(doctype, rank)| {
            let position = ranks.iter().position(|r| r == rank)?;
            let score = if steps == 0 {
                1.0
            } else {
                1.0 - position as f64 / steps as f64
            };
            Some((doctype.clone(), score))
        })
        .collect()
}

/// Empty strings, empty containers, zero, false and null count as absent.
fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// Present and carrying at least one alphanumeric character (placeholders like `"-"` don't count).
fn has_content(value: &JsonValue) -> bool {
    if !truthy(value) {
        return false;
    }
    let flat = match value {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<String>(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    flat.chars().any(char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, d, 8, 30, 0).single().unwrap()
    }

    fn record() -> Record {
        Record::new(7, "2003ASPC..295..283B", day(1))
    }

    #[test]
    fn later_slot_wins_for_shared_keys() {
        let mut rec = record();
        rec.write_slot(Slot::BibData, json!({"citation_count": 3, "title": ["T"]}), day(2));
        rec.write_slot(Slot::NonBibData, json!({"citation_count": 9}), day(3));
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["citation_count"], json!(9));

        let mut rec = record();
        rec.write_slot(Slot::NonBibData, json!({"citation_count": 9}), day(2));
        rec.write_slot(Slot::BibData, json!({"citation_count": 3, "title": ["T"]}), day(3));
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["citation_count"], json!(3));
    }

    #[test]
    fn nonbib_links_win_even_when_bib_is_newer() {
        let mut rec = record();
        rec.write_slot(Slot::NonBibData, json!({"links_data": ["nonbib"]}), day(2));
        rec.write_slot(Slot::BibData, json!({"links_data": ["bib"]}), day(5));
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["links_data"], json!(["nonbib"]));
    }

    #[test]
    fn nonbib_bibgroup_overrides_bib() {
        let mut rec = record();
        rec.write_slot(Slot::NonBibData, json!({"bibgroup": ["CfA"]}), day(2));
        rec.write_slot(
            Slot::BibData,
            json!({"bibgroup": ["CXC"], "bibgroup_facet": ["CXC"]}),
            day(5),
        );
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["bibgroup"], json!(["CfA"]));
        assert_eq!(doc["bibgroup_facet"], json!(["CXC"]));
    }

    #[test]
    fn open_access_legacy_links_synthesize_flags() {
        let mut rec = record();
        rec.write_slot(
            Slot::BibData,
            json!({"links_data": ["{\"access\": \"open\", \"type\": \"preprint\"}"]}),
            day(2),
        );
        let merged = DocumentMerger::default().solr_document(&rec);
        assert!(merged.issues.is_empty());
        assert_eq!(
            merged.document["property"],
            json!(["ESOURCE", "ARTICLE", "NOT REFEREED", "EPRINT_OPENACCESS", "OPENACCESS"])
        );
        assert_eq!(merged.document["esources"], json!(["EPRINT_HTML", "EPRINT_PDF"]));
    }

    #[test]
    fn malformed_legacy_links_are_reported_not_fatal() {
        let mut rec = record();
        rec.write_slot(
            Slot::BibData,
            json!({"title": ["T"], "links_data": ["not json"]}),
            day(2),
        );
        let merged = DocumentMerger::default().solr_document(&rec);
        assert_eq!(merged.issues.len(), 1);
        assert_eq!(merged.issues[0].field, "links_data");
        assert_eq!(merged.issues[0].bibcode, "2003ASPC..295..283B");
        assert!(merged.document.get("esources").is_none());
        assert_eq!(merged.document["title"], json!(["T"]));
    }

    #[test]
    fn doctype_boost_is_evenly_spaced_by_rank() {
        let config = MergeConfig {
            doctype_ranking: [("article", 1), ("catalog", 2), ("misc", 3), ("eprint", 1)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            ..MergeConfig::default()
        };
        let merger = DocumentMerger::new(config);
        for (doctype, expected) in [("article", 1.0), ("eprint", 1.0), ("catalog", 0.5), ("misc", 0.0)] {
            let mut rec = record();
            rec.write_slot(Slot::BibData, json!({"doctype": doctype}), day(2));
            let doc = merger.solr_document(&rec).document;
            assert_eq!(doc["doctype_boost"], json!(expected), "{doctype}");
        }

        let mut rec = record();
        rec.write_slot(Slot::BibData, json!({"doctype": "unknown"}), day(2));
        assert_eq!(merger.solr_document(&rec).document["doctype_boost"], JsonValue::Null);
    }

    #[test]
    fn has_lists_only_alphanumeric_fields_sorted() {
        let mut rec = record();
        rec.write_slot(
            Slot::BibData,
            json!({
                "title": ["A title"],
                "aff": ["-", "-"],
                "abstract": "",
                "volume": "295",
                "author": ["Rots, A."],
            }),
            day(2),
        );
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["has"], json!(["author", "title", "volume"]));
    }

    #[test]
    fn nonbib_facets_are_hierarchical() {
        let mut rec = record();
        rec.write_slot(
            Slot::NonBibData,
            json!({
                "grants": ["NASA NNX12", "broken"],
                "uat": ["Astrophysics/Stars/1234"],
                "simbad_objects": ["2419335 sim", "3111723 *"],
                "ned_objects": ["2419335 HII", "7"],
                "planetary_feature": ["Moon/Crater/Tycho/6163"],
                "data": ["CDS:3", "NED:10"],
                "readers": ["r1", "r2"],
            }),
            day(2),
        );
        let merged = DocumentMerger::default().solr_document(&rec);
        let doc = &merged.document;
        assert_eq!(doc["grant"], json!(["NASA", "NNX12"]));
        assert_eq!(doc["grant_facet_hier"], json!(["0/NASA", "1/NASA/NNX12"]));
        assert_eq!(doc["uat"], json!(["Astrophysics/Stars"]));
        assert_eq!(doc["uat_id"], json!(["1234"]));
        assert_eq!(doc["uat_facet_hier"], json!(["0/Astrophysics", "1/Astrophysics/Stars"]));
        assert_eq!(doc["simbtype"], json!(["Other", "Star"]));
        assert_eq!(doc["nedtype"], json!(["HII Region", "Other"]));
        assert_eq!(doc["nedid"], json!(["2419335", "7"]));
        assert_eq!(doc["planetary_feature"], json!(["Moon/Crater/Tycho"]));
        assert_eq!(
            doc["planetary_feature_facet_hier_2level"],
            json!(["0/Moon", "1/Moon/Crater Tycho"])
        );
        assert_eq!(doc["data_facet"], json!(["CDS", "NED"]));
        assert_eq!(doc["read_count"], json!(2));
        let fields = merged.issues.iter().map(|i| i.field).collect::<Vec<_>>();
        assert_eq!(fields, vec!["grants", "ned_objects"]);
    }

    #[test]
    fn orcid_fulltext_and_metrics_derivations() {
        let mut rec = record();
        rec.write_slot(Slot::OrcidClaims, json!({"verified": ["0000-1"], "unverified": ["-"]}), day(2));
        rec.write_slot(
            Slot::Fulltext,
            json!({"body": "INTRODUCTION", "acknowledgements": "thanks", "facility": ["HST"]}),
            day(2),
        );
        rec.write_slot(Slot::Metrics, json!({"citations": ["a", "b"], "citation_num": 2}), day(2));
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["orcid_user"], json!(["0000-1"]));
        assert_eq!(doc["orcid_other"], json!(["-"]));
        assert_eq!(doc["body"], json!("INTRODUCTION"));
        assert_eq!(doc["ack"], json!("thanks"));
        assert_eq!(doc["facility"], json!(["HST"]));
        assert_eq!(doc["citation"], json!(["a", "b"]));
        assert_eq!(doc["id"], json!(7));
        assert!(doc.get("citation_num").is_none());
    }

    #[test]
    fn augments_prefer_raw_affiliations() {
        let mut rec = record();
        rec.write_slot(Slot::BibData, json!({"aff": ["bib aff"]}), day(2));
        rec.write_slot(Slot::Augments, json!({"aff_raw": ["raw aff"], "aff_id": ["A1"]}), day(3));
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["aff"], json!(["raw aff"]));
        assert_eq!(doc["aff_id"], json!(["A1"]));
        assert_eq!(doc["institution"], JsonValue::Null);
    }

    #[test]
    fn timestamps_summarize_latest_update() {
        let mut rec = record();
        rec.write_slot(Slot::BibData, json!({"title": ["T"]}), day(2));
        rec.write_slot(Slot::Metrics, json!({"citations": []}), day(4));
        let doc = DocumentMerger::default().solr_document(&rec).document;
        assert_eq!(doc["metadata_mtime"], json!("2023-05-02T08:30:00.000000Z"));
        assert_eq!(doc["update_timestamp"], json!("2023-05-04T08:30:00.000000Z"));
        assert!(doc.get("nonbib_mtime").is_none());
    }

    #[test]
    fn merge_is_deterministic() {
        let mut rec = record();
        rec.write_slot(Slot::BibData, json!({"title": ["T"], "doctype": "article"}), day(2));
        rec.write_slot(Slot::NonBibData, json!({"grants": ["NSF 1"], "boost": 0.2}), day(2));
        rec.write_slot(Slot::OrcidClaims, json!({"verified": ["x"]}), day(2));
        let merger = DocumentMerger::default();
        let a = serde_json::to_string(&merger.solr_document(&rec).document).unwrap();
        let b = serde_json::to_string(&merger.solr_document(&rec.clone()).document).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn metrics_document_is_narrow_and_keyed_by_record() {
        let mut rec = record();
        rec.write_slot(
            Slot::Metrics,
            json!({"bibcode": "stale", "refereed": true, "citation_num": 4, "junk": 1}),
            day(2),
        );
        let doc = DocumentMerger::default().metrics_document(&rec).document;
        assert_eq!(
            JsonValue::Object(doc),
            json!({"bibcode": "2003ASPC..295..283B", "refereed": true, "citation_num": 4})
        );
    }

    #[test]
    fn links_document_prefers_nonbib_rows() {
        let mut rec = record();
        rec.write_slot(Slot::NonBibData, json!({"data_links_rows": [{"baz": 0}]}), day(1));
        rec.write_slot(Slot::BibData, json!({"links_data": ["{\"url\": \"u\"}"]}), day(3));
        let doc = DocumentMerger::default().links_document(&rec).document;
        assert_eq!(
            JsonValue::Object(doc),
            json!({"bibcode": "2003ASPC..295..283B", "data_links_rows": [{"baz": 0}]})
        );

        let mut bib_only = record();
        bib_only.write_slot(Slot::BibData, json!({"links_data": ["{\"url\": \"u\"}", "bad"]}), day(3));
        let merged = DocumentMerger::default().links_document(&bib_only);
        assert_eq!(merged.document["data_links_rows"], json!([{"url": "u"}]));
        assert_eq!(merged.issues.len(), 1);
    }

    #[test]
    fn object_class_mappings() {
        assert_eq!(simbad_class("GinCl"), "Galaxy");
        assert_eq!(simbad_class("RadioG"), "Galaxy");
        assert_eq!(simbad_class("PN?"), "Nebula");
        assert_eq!(simbad_class("Radio"), "Radio");
        assert_eq!(ned_class("!V*"), "Galactic Object");
        assert_eq!(ned_class("GPair"), "Galaxy");
        assert_eq!(ned_class("Psr"), "Star");
        assert_eq!(ned_class("zzz"), "Other");
        assert_eq!(hier_facet(&["a", "b", "c"]), vec!["0/a", "1/a/b", "2/a/b/c"]);
    }
}
