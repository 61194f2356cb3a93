//! Blocked annotation designs.
//!
//! A design lists, for every observation slot, which annotator rates which
//! document. Blocks never share annotators or documents; inside a block every
//! annotator rates every document.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AnnoError;

/// Parallel annotator/document index arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Design {
    pub annotators: Vec<usize>,
    pub documents: Vec<usize>,
}

impl Design {
    /// Number of observation slots (per system).
    pub fn len(&self) -> usize {
        self.annotators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotators.is_empty()
    }

    /// Number of annotator indices the design spans (max index + 1).
    pub fn annotator_count(&self) -> usize {
        self.annotators.iter().max().map_or(0, |m| m + 1)
    }

    /// Number of document indices the design spans (max index + 1).
    pub fn document_count(&self) -> usize {
        self.documents.iter().max().map_or(0, |m| m + 1)
    }

    /// Iterate over `(annotator, document)` slots.
    pub fn slots(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.annotators
            .iter()
            .copied()
            .zip(self.documents.iter().copied())
    }
}

/// Build a blocked design.
///
/// Each of the `block_count` blocks gets `block_size` fresh documents and
/// `block_annotator_count` fresh annotators, fully crossed within the block.
/// Non-positive counts yield an empty design.
pub fn create_design(block_count: usize, block_size: usize, block_annotator_count: usize) -> Design {
    let total = block_count * block_size * block_annotator_count;
    let mut annotators = Vec::with_capacity(total);
    let mut documents = Vec::with_capacity(total);

    let mut first_annotator = 0;
    let mut first_document = 0;
    for _ in 0..block_count {
        for annotator in first_annotator..first_annotator + block_annotator_count {
            for document in first_document..first_document + block_size {
                annotators.push(annotator);
                documents.push(document);
            }
        }
        first_annotator += block_annotator_count;
        first_document += block_size;
    }

    Design {
        annotators,
        documents,
    }
}

/// Whether annotators are shared across the conditions being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignMode {
    Crossed,
    Nested,
}

impl DesignMode {
    /// Single-annotator blocks are analysed as nested, everything else as crossed.
    pub fn for_block_annotators(block_annotator_count: usize) -> Self {
        if block_annotator_count == 1 {
            Self::Nested
        } else {
            Self::Crossed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crossed => "crossed",
            Self::Nested => "nested",
        }
    }
}

impl fmt::Display for DesignMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode string handed to the regression collaborator: `<crossed|nested>[:<extra>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionMode {
    pub design: DesignMode,
    pub extra: Option<String>,
}

impl RegressionMode {
    pub fn new(design: DesignMode) -> Self {
        Self {
            design,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }
}

impl fmt::Display for RegressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.extra {
            Some(extra) => write!(f, "{}:{}", self.design, extra),
            None => write!(f, "{}", self.design),
        }
    }
}

impl FromStr for RegressionMode {
    type Err = AnnoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (design, extra) = match s.split_once(':') {
            Some((design, extra)) => (design, Some(extra.to_string())),
            None => (s, None),
        };
        let design = match design {
            "crossed" => DesignMode::Crossed,
            "nested" => DesignMode::Nested,
            other => {
                return Err(AnnoError::invalid_input(format!(
                    "unknown design mode '{other}', expected 'crossed' or 'nested'"
                )));
            }
        };
        Ok(Self { design, extra })
    }
}
