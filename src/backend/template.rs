use std::collections::HashMap;
use std::path::Path;

use serde_json::{Value, json};

use super::JobDescription;
use crate::config::WorkflowPaths;
use crate::error::MutateError;
use crate::state_machine::{ArtifactRef, Category, Job};

/// Builds the concrete description of a job from its resolved inputs.
/// Called once per attempt, right before submission.
pub trait WorkflowMutator: Send + Sync {
    fn build(&self, job: &Job, inputs: &[ArtifactRef]) -> Result<JobDescription, MutateError>;
}

/// Emits the job parameters as plain JSON. Used when no templates are
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughMutator;

impl WorkflowMutator for PassthroughMutator {
    fn build(&self, job: &Job, inputs: &[ArtifactRef]) -> Result<JobDescription, MutateError> {
        Ok(JobDescription {
            job_id: job.id.clone(),
            category: job.category,
            workflow: json!({
                "job_id": job.id,
                "stream": job.stream,
                "category": job.category,
                "sequence": job.sequence_number,
                "start_unit": job.start_unit,
                "unit_count": job.unit_count,
                "inputs": inputs,
            }),
        })
    }
}

/// Fills one JSON workflow template per category.
///
/// Every string value in the template may contain `${name}` placeholders:
/// `job_id`, `stream`, `category`, `sequence`, `start_unit`, `unit_count`
/// and `input_N` (0-based index into the resolved inputs). A string that is
/// exactly one numeric placeholder is replaced by the number itself, and
/// `"${inputs}"` by the array of all inputs. Unknown placeholders are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct TemplateMutator {
    templates: HashMap<Category, Value>,
}

impl TemplateMutator {
    pub fn new(templates: HashMap<Category, Value>) -> Self {
        Self { templates }
    }

    /// Reads every configured template. Categories without a path get no
    /// template and fail at build time.
    pub fn load(paths: &WorkflowPaths) -> Result<Self, MutateError> {
        let mut templates = HashMap::new();
        for category in Category::ALL {
            if let Some(path) = paths.for_category(category) {
                templates.insert(category, read_template(path)?);
            }
        }
        Ok(Self { templates })
    }
}

fn read_template(path: &Path) -> Result<Value, MutateError> {
    let raw = std::fs::read_to_string(path).map_err(|source| MutateError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| MutateError::Parse {
        path: path.display().to_string(),
        source,
    })
}

struct Bindings<'a> {
    job: &'a Job,
    inputs: &'a [ArtifactRef],
}

impl Bindings<'_> {
    fn number(&self, key: &str) -> Option<u64> {
        match key {
            "sequence" => Some(u64::from(self.job.sequence_number)),
            "start_unit" => Some(self.job.start_unit),
            "unit_count" => Some(self.job.unit_count),
            _ => None,
        }
    }

    fn text(&self, key: &str) -> Result<Option<String>, MutateError> {
        if let Some(n) = self.number(key) {
            return Ok(Some(n.to_string()));
        }
        let value = match key {
            "job_id" => self.job.id.to_string(),
            "stream" => self.job.stream.clone(),
            "category" => self.job.category.to_string(),
            _ => {
                let Some(index) = key.strip_prefix("input_").and_then(|i| i.parse::<usize>().ok()) else {
                    return Ok(None);
                };
                let input = self.inputs.get(index).ok_or(MutateError::MissingInput {
                    job: self.job.id.clone(),
                    index,
                    available: self.inputs.len(),
                })?;
                input.as_str().to_string()
            }
        };
        Ok(Some(value))
    }

    fn whole(&self, s: &str) -> Option<Value> {
        let key = s.strip_prefix("${")?.strip_suffix('}')?;
        if key == "inputs" {
            return Some(json!(self.inputs));
        }
        self.number(key).map(Value::from)
    }

    fn substitute(&self, s: &str) -> Result<String, MutateError> {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let key = &after[..end];
            match self.text(key)? {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn fill(&self, value: &mut Value) -> Result<(), MutateError> {
        match value {
            Value::String(s) => {
                if let Some(replacement) = self.whole(s) {
                    *value = replacement;
                } else if s.contains("${") {
                    *s = self.substitute(s)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.fill(item)?;
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.fill(item)?;
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }
}

impl WorkflowMutator for TemplateMutator {
    fn build(&self, job: &Job, inputs: &[ArtifactRef]) -> Result<JobDescription, MutateError> {
        let mut workflow = self
            .templates
            .get(&job.category)
            .cloned()
            .ok_or(MutateError::MissingTemplate(job.category))?;
        Bindings { job, inputs }.fill(&mut workflow)?;
        Ok(JobDescription {
            job_id: job.id.clone(),
            category: job.category,
            workflow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::RetryConfig;

    fn job() -> Job {
        Job::new("clip", Category::Refinement, 2, 161, 161, vec![], RetryConfig::default())
    }

    fn mutator(template: Value) -> TemplateMutator {
        TemplateMutator::new(HashMap::from([(Category::Refinement, template)]))
    }

    #[test]
    fn fills_placeholders_in_nested_strings() {
        let m = mutator(json!({
            "7": {"inputs": {"latent": "${input_0}", "prefix": "${stream}_${category}_${sequence}"}},
            "9": {"inputs": {"start_frame": "${start_unit}", "frames": ["${unit_count}", 1]}},
            "id": "${job_id}"
        }));
        let inputs = [ArtifactRef::new("latents/clip_002.latent")];
        let d = m.build(&job(), &inputs).unwrap();

        assert_eq!(d.workflow["7"]["inputs"]["latent"], json!("latents/clip_002.latent"));
        assert_eq!(d.workflow["7"]["inputs"]["prefix"], json!("clip_refinement_2"));
        assert_eq!(d.workflow["9"]["inputs"]["start_frame"], json!(161));
        assert_eq!(d.workflow["9"]["inputs"]["frames"], json!([161, 1]));
        assert_eq!(d.workflow["id"], json!("clip/refinement/002"));
        assert_eq!(d.job_id, job().id);
    }

    #[test]
    fn whole_inputs_placeholder_becomes_array() {
        let m = mutator(json!({"videos": "${inputs}"}));
        let inputs = [ArtifactRef::new("a.mp4"), ArtifactRef::new("b.mp4")];
        let d = m.build(&job(), &inputs).unwrap();
        assert_eq!(d.workflow["videos"], json!(["a.mp4", "b.mp4"]));
    }

    #[test]
    fn unknown_placeholders_are_kept() {
        let m = mutator(json!({"x": "${seed} and ${stream", "y": "${nope}"}));
        let d = m.build(&job(), &[]).unwrap();
        assert_eq!(d.workflow["x"], json!("${seed} and ${stream"));
        assert_eq!(d.workflow["y"], json!("${nope}"));
    }

    #[test]
    fn missing_input_and_template_are_errors() {
        let m = mutator(json!({"latent": "${input_1}"}));
        let err = m.build(&job(), &[ArtifactRef::new("only")]).unwrap_err();
        assert!(matches!(err, MutateError::MissingInput { index: 1, available: 1, .. }));

        let primary = Job::new("clip", Category::Primary, 1, 0, 1, vec![], RetryConfig::default());
        assert!(matches!(
            m.build(&primary, &[]),
            Err(MutateError::MissingTemplate(Category::Primary))
        ));
    }

    #[test]
    fn load_reads_configured_templates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refine.json");
        std::fs::write(&path, r#"{"n": "${sequence}"}"#).unwrap();
        let paths = WorkflowPaths {
            refinement: Some(path),
            ..WorkflowPaths::default()
        };
        let d = TemplateMutator::load(&paths).unwrap().build(&job(), &[]).unwrap();
        assert_eq!(d.workflow["n"], json!(2));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        let paths = WorkflowPaths {
            primary: Some(bad),
            ..WorkflowPaths::default()
        };
        assert!(matches!(TemplateMutator::load(&paths), Err(MutateError::Parse { .. })));
    }

    #[test]
    fn passthrough_describes_the_job() {
        let d = PassthroughMutator.build(&job(), &[ArtifactRef::new("in")]).unwrap();
        assert_eq!(d.workflow["category"], json!("refinement"));
        assert_eq!(d.workflow["inputs"], json!(["in"]));
        assert_eq!(d.workflow["unit_count"], json!(161));
    }
}
