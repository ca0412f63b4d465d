use std::{collections::BTreeMap, fs, path::Path};

use abmatrix_validation::{ConsistencyValidator, ProvidedContext, RuleEvaluator, TestDefinition};
use walkdir::WalkDir;

use crate::{AppError, Result};

/// A parsed definition and the file it came from
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionFile {
    pub path: String,
    pub definition: TestDefinition,
}

/// Test name to definition, sorted by name
pub type Definitions = BTreeMap<String, DefinitionFile>;

/// Reads every `<test-name>.yaml` or `<test-name>.json` file under `root`.
/// Only performs file level validation, e.g. suffix, name, shape
pub fn load_definitions(root: &str) -> Result<Definitions> {
    let mut definitions = Definitions::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let dir_entry = entry?;
        if !dir_entry.file_type().is_file() {
            continue;
        }
        let path = dir_entry.path();
        let path_string = path.display().to_string();

        let document = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") => {
                return Err(AppError::Validation(format!(
                    "Invalid file {}: expected .yaml, found .yml",
                    path_string
                )));
            }
            Some("yaml") => parse_yaml(&path_string)?,
            Some("json") => serde_json::from_reader(fs::File::open(path)?)?,
            // skip READMEs and the like
            _ => continue,
        };

        let test_name = test_name(path)?;
        let definition: TestDefinition = serde_json::from_value(document).map_err(|e| {
            AppError::Validation(format!("Invalid definition in {}: {}", path_string, e))
        })?;

        if let Some(first) = definitions.get(&test_name) {
            return Err(AppError::DuplicateTest {
                test: test_name,
                first_file: first.path.clone(),
                second_file: path_string,
            });
        }
        definitions.insert(
            test_name,
            DefinitionFile {
                path: path_string,
                definition,
            },
        );
    }
    Ok(definitions)
}

fn parse_yaml(path: &str) -> Result<serde_json::Value> {
    let file = fs::File::open(path)?;
    let data: serde_yaml::Value =
        serde_yaml::from_reader(file).map_err(|e| AppError::YamlParse {
            path: path.to_string(),
            source: e,
        })?;
    if !data.is_mapping() {
        return Err(AppError::Validation(format!(
            "Invalid YAML structure in {}: expected a mapping",
            path
        )));
    }
    Ok(serde_json::to_value(data)?)
}

/// File stem, restricted to the characters test names may use
fn test_name(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::Validation(format!(
            "Invalid test name '{}' in {}: use letters, digits and '_'",
            stem,
            path.display()
        )));
    }
    Ok(stem.to_string())
}

/// Runs the structural checks on every definition and reports all failures at once
pub fn verify_definitions(definitions: &Definitions) -> Result<()> {
    let evaluator = RuleEvaluator::default();
    let provided = ProvidedContext::syntax_only();
    let validator = ConsistencyValidator::new(&evaluator, &provided);

    let errors: Vec<String> = definitions
        .iter()
        .filter_map(|(name, file)| {
            validator
                .verify(name, &file.path, &file.definition)
                .err()
                .map(|e| format!("{}: {}", file.path, e.message))
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid test definitions:\n{}",
            errors.join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn definition_yaml(length: f64) -> String {
        format!(
            r##"
testType: USER
salt: sample_tst
buckets:
  - name: control
    value: 0
allocations:
  - id: "#A1"
    ranges:
      - bucketValue: 0
        length: {length}
"##
        )
    }

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn load(dir: &TempDir) -> Result<Definitions> {
        load_definitions(dir.path().to_str().unwrap())
    }

    #[test]
    fn test_load_nonexistent_directory() {
        let result = load_definitions("/foo/bar/baz");
        assert!(matches!(result, Err(AppError::Walk(_))));
    }

    #[test]
    fn test_loads_yaml_and_json_recursively() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a_tst.yaml", &definition_yaml(1.0));
        write(
            temp.path(),
            "team/b_tst.json",
            r##"{"testType": "ACCOUNT", "salt": "b", "buckets": [{"name": "on", "value": 1}],
                "allocations": [{"id": "#B1", "ranges": [{"bucketValue": 1, "length": 1.0}]}]}"##,
        );
        write(temp.path(), "README.md", "# definitions");

        let loaded = load(&temp).unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["a_tst", "b_tst"]);
        assert!(loaded["b_tst"].path.ends_with("b_tst.json"));
        verify_definitions(&loaded).unwrap();
    }

    #[test]
    fn test_yml_extension_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "bad_tst.yml", &definition_yaml(1.0));
        match load(&temp) {
            Err(AppError::Validation(msg)) => assert!(msg.contains("expected .yaml, found .yml")),
            other => panic!("Expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_test_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "one/dup_tst.yaml", &definition_yaml(1.0));
        write(temp.path(), "two/dup_tst.yaml", &definition_yaml(1.0));
        match load(&temp) {
            Err(AppError::DuplicateTest {
                test,
                first_file,
                second_file,
            }) => {
                assert_eq!(test, "dup_tst");
                assert!(first_file.contains("one"));
                assert!(second_file.contains("two"));
            }
            other => panic!("Expected DuplicateTest error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_test_name_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "bad-name.yaml", &definition_yaml(1.0));
        assert!(matches!(load(&temp), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "broken_tst.yaml", "buckets: [unclosed");
        assert!(matches!(load(&temp), Err(AppError::YamlParse { .. })));

        let temp = TempDir::new().unwrap();
        write(temp.path(), "list_tst.yaml", "- a\n- b\n");
        assert!(matches!(load(&temp), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_verify_reports_every_failure() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "x_tst.yaml", &definition_yaml(0.5));
        write(temp.path(), "y_tst.yaml", &definition_yaml(0.7));
        write(temp.path(), "z_tst.yaml", &definition_yaml(1.0));

        let loaded = load(&temp).unwrap();
        match verify_definitions(&loaded) {
            Err(AppError::Validation(msg)) => {
                assert!(msg.contains("x_tst.yaml"));
                assert!(msg.contains("y_tst.yaml"));
                assert!(!msg.contains("z_tst.yaml"));
            }
            other => panic!("Expected Validation error, got {other:?}"),
        }
    }
}
