use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};

/// One `--exclude Class.field=threshold` rule before index resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExclusionRule {
    pub field: String,
    pub threshold: u64,
}

/// Everything the engine consumes; produced by the CLI (or a test fixture)
/// and passed by reference through every component.
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    /// Element count above which a collection or map becomes a candidate.
    pub size_threshold: u64,
    /// Recorded-edge cap per (target, referring class).
    pub max_fan_in: u32,
    /// Heap scan budget; 0 skips graph building entirely.
    pub max_passes: u32,
    /// Whether stack/native locals count as acceptable chain roots.
    pub consider_local_refs: bool,
    /// Report candidates with no root chain, with their raw references.
    pub show_unreachable: bool,
    /// Thread id of the analysis worker; its own locals are self-noise.
    pub self_thread: Option<u64>,
    /// Class names never flagged as candidates.
    pub ignore_classes: HashSet<String>,
    /// Field-exclusion rules keyed by referring class name.
    pub exclusions: HashMap<String, Vec<ExclusionRule>>,
}

impl Default for AnalysisConfig {
    fn default() -> AnalysisConfig {
        AnalysisConfig {
            size_threshold: 500,
            max_fan_in: 5,
            max_passes: 0,
            consider_local_refs: false,
            show_unreachable: false,
            self_thread: None,
            ignore_classes: HashSet::new(),
            exclusions: HashMap::new(),
        }
    }
}

impl AnalysisConfig {
    /// Parse one `Class.field=threshold` exclusion and add it.
    pub fn add_exclusion(&mut self, spec: &str) -> Result<()> {
        let (path, threshold) = spec
            .split_once('=')
            .with_context(|| format!("exclusion '{}' is missing '=threshold'", spec))?;
        let threshold: u64 = threshold
            .trim()
            .parse()
            .with_context(|| format!("bad threshold in exclusion '{}'", spec))?;
        let Some((class, field)) = path.rsplit_once('.') else {
            bail!("exclusion '{}' has no class name", spec);
        };
        if class.is_empty() || field.is_empty() {
            bail!("exclusion '{}' has an empty class or field name", spec);
        }
        debug!(
            "exclusion rule: class [{}], field [{}], limit {}",
            class, field, threshold
        );
        self.exclusions
            .entry(class.to_string())
            .or_default()
            .push(ExclusionRule {
                field: field.to_string(),
                threshold,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_exclusion() {
        let mut cfg = AnalysisConfig::default();
        cfg.add_exclusion("com.example.Registry.cache=1000").unwrap();
        let rules = &cfg.exclusions["com.example.Registry"];
        assert_eq!(
            rules[0],
            ExclusionRule {
                field: "cache".to_string(),
                threshold: 1000
            }
        );
    }

    #[test]
    fn test_add_exclusion_rejects_malformed() {
        let mut cfg = AnalysisConfig::default();
        assert!(cfg.add_exclusion("NoEquals").is_err());
        assert!(cfg.add_exclusion("NoDot=5").is_err());
        assert!(cfg.add_exclusion("Class.field=abc").is_err());
        assert!(cfg.add_exclusion(".f=1").is_err());
        assert!(cfg.add_exclusion("C.=1").is_err());
    }
}
