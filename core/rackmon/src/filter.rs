//! Metric filtering, applied by the accumulator after name and tag
//! resolution.
//!
//! A [`Filter`] holds the rules as written in the configuration file; it is
//! compiled once at startup into a [`CompiledFilter`], so bad patterns are
//! configuration errors and matching a metric costs no compilation.

use globset::{Glob, GlobSet, GlobSetBuilder};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::metric::{Fields, Tags};

/// Filtering rules of one input.
///
/// Every list is optional; an empty list leaves the corresponding rule
/// inactive. Patterns use the usual glob syntax (`*`, `?`, `[ab]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Filter {
    /// Accept only measurements whose resolved name matches one of these
    /// patterns.
    pub name_pass: Vec<String>,
    /// Reject measurements whose resolved name matches one of these patterns.
    pub name_drop: Vec<String>,
    /// Keep only the fields whose key matches one of these patterns.
    pub field_pass: Vec<String>,
    /// Remove the fields whose key matches one of these patterns.
    pub field_drop: Vec<String>,
    /// Accept only metrics carrying at least one of these tags with a
    /// matching value.
    pub tag_pass: Vec<TagPatterns>,
    /// Reject metrics carrying at least one of these tags with a matching
    /// value.
    pub tag_drop: Vec<TagPatterns>,
    /// Remove the tags whose key matches one of these patterns.
    pub tag_exclude: Vec<String>,
    /// Keep only the tags whose key matches one of these patterns.
    pub tag_include: Vec<String>,
}

/// One tag-based rule: a tag name and the value patterns it is checked
/// against.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagPatterns {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    /// True when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.name_pass.is_empty()
            && self.name_drop.is_empty()
            && self.field_pass.is_empty()
            && self.field_drop.is_empty()
            && self.tag_pass.is_empty()
            && self.tag_drop.is_empty()
            && self.tag_exclude.is_empty()
            && self.tag_include.is_empty()
    }

    /// Compiles the glob patterns for fast matching.
    pub fn compile(&self) -> Result<CompiledFilter, globset::Error> {
        Ok(CompiledFilter {
            name_pass: compile_globs(&self.name_pass)?,
            name_drop: compile_globs(&self.name_drop)?,
            field_pass: compile_globs(&self.field_pass)?,
            field_drop: compile_globs(&self.field_drop)?,
            tag_pass: compile_tag_globs(&self.tag_pass)?,
            tag_drop: compile_tag_globs(&self.tag_drop)?,
            tag_exclude: compile_globs(&self.tag_exclude)?,
            tag_include: compile_globs(&self.tag_include)?,
        })
    }
}

fn compile_globs(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build().map(Some)
}

fn compile_tag_globs(patterns: &[TagPatterns]) -> Result<Option<FxHashMap<String, GlobSet>>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut map = FxHashMap::default();
    for tag in patterns {
        let mut builder = GlobSetBuilder::new();
        for pattern in &tag.values {
            builder.add(Glob::new(pattern)?);
        }
        map.insert(tag.name.clone(), builder.build()?);
    }
    Ok(Some(map))
}

/// The compiled form of a [`Filter`]. An inactive rule is `None`.
#[derive(Debug, Default)]
pub struct CompiledFilter {
    name_pass: Option<GlobSet>,
    name_drop: Option<GlobSet>,
    field_pass: Option<GlobSet>,
    field_drop: Option<GlobSet>,
    tag_pass: Option<FxHashMap<String, GlobSet>>,
    tag_drop: Option<FxHashMap<String, GlobSet>>,
    tag_exclude: Option<GlobSet>,
    tag_include: Option<GlobSet>,
}

impl CompiledFilter {
    /// Applies the rules to one metric.
    ///
    /// Returns `false` when the metric must be dropped. The field pass/drop
    /// lists remove fields from the map in place (removing every field drops
    /// the metric), and the tag include/exclude lists remove tags in place.
    pub fn apply(&self, name: &str, fields: &mut Fields, tags: &mut Tags) -> bool {
        if !self.name_passes(name) {
            return false;
        }
        if !self.tags_pass(tags) {
            return false;
        }
        if let Some(pass) = &self.field_pass {
            fields.retain(|key, _| pass.is_match(key));
        }
        if let Some(drop) = &self.field_drop {
            fields.retain(|key, _| !drop.is_match(key));
        }
        if fields.is_empty() {
            return false;
        }
        if let Some(include) = &self.tag_include {
            tags.retain(|key, _| include.is_match(key));
        }
        if let Some(exclude) = &self.tag_exclude {
            tags.retain(|key, _| !exclude.is_match(key));
        }
        true
    }

    fn name_passes(&self, name: &str) -> bool {
        if let Some(pass) = &self.name_pass {
            if !pass.is_match(name) {
                return false;
            }
        }
        if let Some(drop) = &self.name_drop {
            if drop.is_match(name) {
                return false;
            }
        }
        true
    }

    fn tags_pass(&self, tags: &Tags) -> bool {
        if let Some(pass) = &self.tag_pass {
            let selected = tags
                .iter()
                .any(|(key, value)| pass.get(key).is_some_and(|set| set.is_match(value)));
            if !selected {
                return false;
            }
        }
        if let Some(drop) = &self.tag_drop {
            let selected = tags
                .iter()
                .any(|(key, value)| drop.get(key).is_some_and(|set| set.is_match(value)));
            if selected {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fields, tags};
    use pretty_assertions::assert_eq;

    fn compiled(filter: Filter) -> CompiledFilter {
        filter.compile().unwrap()
    }

    #[test]
    fn empty_filter_passes_everything() {
        let f = compiled(Filter::default());
        let mut fields = fields! { "x" => 1i64 };
        let mut tags = tags! { "a" => "b" };
        assert!(f.apply("anything", &mut fields, &mut tags));
        assert_eq!(fields.len(), 1);
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn name_pass_and_drop() {
        let f = compiled(Filter {
            name_pass: vec!["cpu*".into(), "mem".into()],
            name_drop: vec!["cpu_guest".into()],
            ..Default::default()
        });
        let mut fields = fields! { "x" => 1i64 };
        let mut tags = Tags::new();
        assert!(f.apply("cpu_user", &mut fields.clone(), &mut tags));
        assert!(f.apply("mem", &mut fields.clone(), &mut tags));
        assert!(!f.apply("disk", &mut fields.clone(), &mut tags));
        assert!(!f.apply("cpu_guest", &mut fields, &mut tags));
    }

    #[test]
    fn field_filtering_mutates_in_place() {
        let f = compiled(Filter {
            field_drop: vec!["*_human".into()],
            ..Default::default()
        });
        let mut fields = fields! { "uptime" => 3i64, "uptime_human" => "3s" };
        let mut tags = Tags::new();
        assert!(f.apply("m", &mut fields, &mut tags));
        assert_eq!(fields, fields! { "uptime" => 3i64 });
    }

    #[test]
    fn removing_every_field_drops_the_metric() {
        let f = compiled(Filter {
            field_pass: vec!["rx_*".into()],
            ..Default::default()
        });
        let mut fields = fields! { "tx_bytes" => 1i64 };
        let mut tags = Tags::new();
        assert!(!f.apply("m", &mut fields, &mut tags));
    }

    #[test]
    fn tag_pass_selects_on_values() {
        let f = compiled(Filter {
            tag_pass: vec![TagPatterns {
                name: "role".into(),
                values: vec!["uplink".into(), "server".into()],
            }],
            ..Default::default()
        });
        let mut fields = fields! { "x" => 1i64 };
        assert!(f.apply("m", &mut fields.clone(), &mut tags! { "role" => "uplink" }));
        assert!(!f.apply("m", &mut fields.clone(), &mut tags! { "role" => "ctlr" }));
        assert!(!f.apply("m", &mut fields, &mut Tags::new()));
    }

    #[test]
    fn tag_drop_rejects_on_values() {
        let f = compiled(Filter {
            tag_drop: vec![TagPatterns {
                name: "port".into(),
                values: vec!["mgmt*".into()],
            }],
            ..Default::default()
        });
        let mut fields = fields! { "x" => 1i64 };
        assert!(!f.apply("m", &mut fields.clone(), &mut tags! { "port" => "mgmt0" }));
        assert!(f.apply("m", &mut fields, &mut tags! { "port" => "swp1" }));
    }

    #[test]
    fn tag_exclude_trims_tags() {
        let f = compiled(Filter {
            tag_exclude: vec!["internal_*".into()],
            ..Default::default()
        });
        let mut fields = fields! { "x" => 1i64 };
        let mut tags = tags! { "internal_id" => "77", "port" => "swp1" };
        assert!(f.apply("m", &mut fields, &mut tags));
        assert_eq!(tags, tags! { "port" => "swp1" });
    }

    #[test]
    fn invalid_pattern_is_a_compile_error() {
        let filter = Filter {
            name_pass: vec!["a[".into()],
            ..Default::default()
        };
        assert!(filter.compile().is_err());
    }

    #[test]
    fn deserializes_from_toml() {
        let filter: Filter = toml::from_str(indoc::indoc! {r#"
            name_drop = ["*_debug"]
            field_drop = ["*_human"]

            [[tag_pass]]
            name = "role"
            values = ["server"]
        "#})
        .unwrap();
        assert_eq!(filter.name_drop, vec!["*_debug".to_string()]);
        assert_eq!(filter.tag_pass[0].name, "role");
        assert!(!filter.is_empty());
    }
}
