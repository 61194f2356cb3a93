//! Annotation tables: one score per (system, annotator, document).
//!
//! Synthetic samples drawn from an [`OrdinalModel`](crate::ordinal::OrdinalModel)
//! and real annotation files share this representation. Labels are interned
//! to dense indices so aggregation and resampling work on integers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use crate::error::{AnnoError, Result};
use crate::grouping::AnnotatorGroup;
use crate::results::csv_escape;

/// A single judgment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub system: usize,
    pub annotator: usize,
    pub document: usize,
    pub score: f64,
}

/// Table of judgments keyed by (system, annotator, document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationTable {
    systems: Vec<String>,
    annotators: Vec<String>,
    documents: Vec<String>,
    rows: Vec<Annotation>,
    /// Group index per annotator index, once groups are attached.
    annotator_groups: Option<Vec<usize>>,
}

impl AnnotationTable {
    /// Build a table, checking every row against the label vectors.
    pub fn new(
        systems: Vec<String>,
        annotators: Vec<String>,
        documents: Vec<String>,
        rows: Vec<Annotation>,
    ) -> Result<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.system >= systems.len()
                || row.annotator >= annotators.len()
                || row.document >= documents.len()
            {
                return Err(AnnoError::invalid_input(format!(
                    "row {idx} references an unknown system, annotator or document"
                )));
            }
        }
        Ok(Self {
            systems,
            annotators,
            documents,
            rows,
            annotator_groups: None,
        })
    }

    /// Table whose annotators and documents are labelled by their index.
    pub(crate) fn synthetic(
        systems: Vec<String>,
        annotator_count: usize,
        document_count: usize,
        rows: Vec<Annotation>,
    ) -> Self {
        Self {
            systems,
            annotators: (0..annotator_count).map(|i| i.to_string()).collect(),
            documents: (0..document_count).map(|i| i.to_string()).collect(),
            rows,
            annotator_groups: None,
        }
    }

    pub fn systems(&self) -> &[String] {
        &self.systems
    }

    pub fn annotator_labels(&self) -> &[String] {
        &self.annotators
    }

    pub fn document_labels(&self) -> &[String] {
        &self.documents
    }

    pub fn rows(&self) -> &[Annotation] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn system_index(&self, name: &str) -> Option<usize> {
        self.systems.iter().position(|s| s == name)
    }

    pub fn annotator_index(&self, label: &str) -> Option<usize> {
        self.annotators.iter().position(|a| a == label)
    }

    /// Distinct annotator indices that actually appear in the rows.
    pub fn annotator_ids(&self) -> BTreeSet<usize> {
        self.rows.iter().map(|r| r.annotator).collect()
    }

    /// Group index of every annotator, if groups were attached.
    pub fn annotator_groups(&self) -> Option<&[usize]> {
        self.annotator_groups.as_deref()
    }

    /// Attach the group index of every annotator (the regression input's group column).
    pub fn with_groups(mut self, groups: &[AnnotatorGroup]) -> Self {
        let mut assignment = vec![0; self.annotators.len()];
        for (group_idx, group) in groups.iter().enumerate() {
            for &annotator in group.members() {
                if let Some(slot) = assignment.get_mut(annotator) {
                    *slot = group_idx;
                }
            }
        }
        self.annotator_groups = Some(assignment);
        self
    }

    /// Scores of one system ordered by (annotator, document).
    ///
    /// Two systems rated on the same design produce aligned vectors, which is
    /// what the unaggregated paired tests rely on.
    pub fn scores_by_slot(&self, system: usize) -> Vec<f64> {
        let keyed: BTreeMap<(usize, usize), f64> = self
            .rows
            .iter()
            .filter(|r| r.system == system)
            .map(|r| ((r.annotator, r.document), r.score))
            .collect();
        keyed.into_values().collect()
    }

    /// Mean score per (system, document), one vector per system ordered by document.
    pub fn means_by_document(&self) -> Vec<Vec<f64>> {
        self.means_by(|row| Some(row.document))
    }

    /// Mean score per (system, annotator group), one vector per system ordered by group.
    pub fn means_by_group(&self) -> Result<Vec<Vec<f64>>> {
        let groups = self.annotator_groups.as_ref().ok_or_else(|| {
            AnnoError::invalid_input("annotator groups must be attached before aggregating by group")
        })?;
        Ok(self.means_by(|row| groups.get(row.annotator).copied()))
    }

    fn means_by(&self, key: impl Fn(&Annotation) -> Option<usize>) -> Vec<Vec<f64>> {
        let mut sums: BTreeMap<(usize, usize), (f64, usize)> = BTreeMap::new();
        for row in &self.rows {
            if let Some(k) = key(row) {
                let entry = sums.entry((row.system, k)).or_insert((0.0, 0));
                entry.0 += row.score;
                entry.1 += 1;
            }
        }
        let mut out = vec![Vec::new(); self.systems.len()];
        for ((system, _), (sum, count)) in sums {
            out[system].push(sum / count as f64);
        }
        out
    }

    /// Mean score per system; `NaN` for systems without rows.
    pub fn system_means(&self) -> Vec<f64> {
        let mut sums = vec![(0.0, 0usize); self.systems.len()];
        for row in &self.rows {
            sums[row.system].0 += row.score;
            sums[row.system].1 += 1;
        }
        sums.into_iter()
            .map(|(sum, count)| {
                if count == 0 {
                    f64::NAN
                } else {
                    sum / count as f64
                }
            })
            .collect()
    }

    /// Sub-table containing only the given annotators. Labels are preserved.
    pub fn select_annotators(&self, annotators: &[usize]) -> Self {
        let keep: BTreeSet<usize> = annotators.iter().copied().collect();
        Self {
            systems: self.systems.clone(),
            annotators: self.annotators.clone(),
            documents: self.documents.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| keep.contains(&r.annotator))
                .copied()
                .collect(),
            annotator_groups: self.annotator_groups.clone(),
        }
    }

    /// Render as CSV: `system,annotator,document[,group],<score_column>`.
    pub fn to_csv(&self, score_column: &str) -> String {
        let mut csv = String::from("system,annotator,document");
        if self.annotator_groups.is_some() {
            csv.push_str(",group");
        }
        let _ = writeln!(csv, ",{score_column}");

        for row in &self.rows {
            let _ = write!(
                csv,
                "{},{},{}",
                csv_escape(&self.systems[row.system]),
                csv_escape(&self.annotators[row.annotator]),
                csv_escape(&self.documents[row.document])
            );
            if let Some(groups) = &self.annotator_groups {
                let _ = write!(csv, ",{}", groups[row.annotator]);
            }
            let _ = writeln!(csv, ",{}", row.score);
        }
        csv
    }

    pub fn write_csv(&self, path: &Path, score_column: &str) -> Result<()> {
        std::fs::write(path, self.to_csv(score_column))?;
        Ok(())
    }

    /// Load an annotation CSV with `annotator`, `document`, `system` and score columns.
    pub fn from_csv_path(path: &Path, score_column: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_csv_str(&content, score_column, path)
    }

    /// Parse annotation CSV text; `origin` is only used in error messages.
    pub fn from_csv_str(content: &str, score_column: &str, origin: &Path) -> Result<Self> {
        let mut lines = content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines
            .next()
            .ok_or_else(|| AnnoError::parse(origin, 1, "empty annotation file"))?;
        let columns = split_csv_line(header);
        let column = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| AnnoError::parse(origin, 1, format!("missing '{name}' column")))
        };
        let system_col = column("system")?;
        let annotator_col = column("annotator")?;
        let document_col = column("document")?;
        let score_col = column(score_column)?;

        let mut systems = Interner::default();
        let mut annotators = Interner::default();
        let mut documents = Interner::default();
        let mut rows = Vec::new();

        for (idx, line) in lines {
            let fields = split_csv_line(line);
            let field = |col: usize| {
                fields.get(col).map(String::as_str).ok_or_else(|| {
                    AnnoError::parse(origin, idx + 1, format!("expected {} fields", columns.len()))
                })
            };
            let raw_score = field(score_col)?;
            // Unrated cells are left empty in exported annotation sheets.
            if raw_score.is_empty() {
                continue;
            }
            let score = raw_score.parse::<f64>().map_err(|e| {
                AnnoError::parse(origin, idx + 1, format!("invalid score '{raw_score}': {e}"))
            })?;
            rows.push(Annotation {
                system: systems.intern(field(system_col)?),
                annotator: annotators.intern(field(annotator_col)?),
                document: documents.intern(field(document_col)?),
                score,
            });
        }

        Self::new(systems.labels, annotators.labels, documents.labels, rows)
    }
}

#[derive(Default)]
struct Interner {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl Interner {
    fn intern(&mut self, label: &str) -> usize {
        if let Some(&idx) = self.index.get(label) {
            return idx;
        }
        let idx = self.labels.len();
        self.labels.push(label.to_string());
        self.index.insert(label.to_string(), idx);
        idx
    }
}

/// Split one CSV line into fields.
///
/// Quoted fields may contain commas and `""` escapes and are kept verbatim;
/// unquoted fields are trimmed.
pub(crate) fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.trim().is_empty() && !quoted => {
                field.clear();
                quoted = true;
                in_quotes = true;
            }
            ',' => fields.push(finish_field(&mut field, &mut quoted)),
            // Text after a closing quote is dropped.
            _ if quoted => {}
            _ => field.push(c),
        }
    }
    fields.push(finish_field(&mut field, &mut quoted));
    fields
}

fn finish_field(field: &mut String, quoted: &mut bool) -> String {
    let value = std::mem::take(field);
    if std::mem::take(quoted) {
        value
    } else {
        value.trim().to_string()
    }
}
