mod loader;
mod output;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use abmatrix::{
    Context, ContextValue, FilterRegistry, ForceGroups, Identifiers, RequestedTests, Resolver,
    Specification, TestType,
};
use abmatrix_validation::{
    ArtifactLoader, ConsistencyValidator, LoadResult, ProvidedContext, RuleEvaluator,
    write_artifact,
};
use clap::{Parser, Subcommand};

/// Result type for operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors that can occur while building, validating or resolving a matrix
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Duplicate test '{test}' defined in {first_file} and {second_file}")]
    DuplicateTest {
        test: String,
        first_file: String,
        second_file: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Artifact error: {0}")]
    Artifact(#[from] abmatrix_validation::ValidationError),

    #[error("Filter configuration error: {0}")]
    Configuration(#[from] abmatrix::ConfigurationError),
}

#[derive(Parser, Debug)]
#[command(name = "abmatrix")]
#[command(version, about = "Build, validate and resolve abmatrix test matrices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an artifact from a directory of test definitions
    Build {
        #[arg(long, help = "directory containing <test-name>.yaml or .json definitions")]
        definitions: String,

        #[arg(long, help = "path of the artifact to write")]
        out: PathBuf,

        #[arg(
            long,
            env = "ABMATRIX_VERSION",
            help = "artifact version, defaults to a timestamp"
        )]
        version: Option<String>,

        #[arg(long, env = "ABMATRIX_AUTHOR", default_value = "abmatrix")]
        author: String,
    },

    /// Check an artifact's structure and consistency
    Validate {
        #[arg(long, env = "ABMATRIX_ARTIFACT")]
        artifact: PathBuf,

        #[arg(long, help = "client specification to verify the artifact against")]
        specification: Option<PathBuf>,
    },

    /// Resolve test groups for one request and print them as JSON
    Resolve {
        #[arg(long, env = "ABMATRIX_ARTIFACT")]
        artifact: PathBuf,

        #[arg(long = "id", value_name = "TYPE=VALUE")]
        ids: Vec<String>,

        #[arg(long = "context", value_name = "KEY=JSON")]
        context: Vec<String>,

        #[arg(long = "test", value_name = "NAME", help = "tests to resolve, all when omitted")]
        tests: Vec<String>,

        #[arg(long, help = "forced groups, e.g. my_tst1,default_to_fallback")]
        force: Option<String>,

        #[arg(long, help = "resolve RANDOM tests")]
        random: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Build {
            definitions,
            out,
            version,
            author,
        } => build(&definitions, &out, version, &author),
        Commands::Validate {
            artifact,
            specification,
        } => validate(&artifact, specification.as_deref()),
        Commands::Resolve {
            artifact,
            ids,
            context,
            tests,
            force,
            random,
        } => {
            let request = ResolveRequest {
                identifiers: parse_identifiers(&ids, random)?,
                context: parse_context(&context)?,
                requested: if tests.is_empty() {
                    RequestedTests::All
                } else {
                    RequestedTests::names(tests)
                },
                force: force.as_deref().map(ForceGroups::parse).unwrap_or_default(),
            };
            let json = resolve(&artifact, &request)?;
            println!("{json}");
            Ok(())
        }
    }
}

fn build(definitions: &str, out: &Path, version: Option<String>, author: &str) -> Result<()> {
    let loaded = loader::load_definitions(definitions)?;
    loader::verify_definitions(&loaded)?;

    let now = chrono::Utc::now();
    let version = version.unwrap_or_else(|| output::default_version(now));
    let artifact = output::assemble_artifact(loaded, &version, author, now);

    // run the assembled document through the same checks a client applies
    let document = serde_json::to_value(&artifact)?;
    let artifact = ArtifactLoader::new()?.from_value(document, out)?;

    write_artifact(out, &artifact)?;
    tracing::info!(
        tests = artifact.tests.len(),
        version = %artifact.audit.version,
        "wrote {}",
        out.display()
    );
    Ok(())
}

fn validate(artifact_path: &Path, specification: Option<&Path>) -> Result<()> {
    let artifact = ArtifactLoader::new()?.load(artifact_path)?;
    let source = artifact_path.display().to_string();
    let evaluator = RuleEvaluator::default();

    let result = match specification {
        Some(spec_path) => {
            let spec = Specification::from_path(spec_path).map_err(|e| {
                AppError::Validation(format!("Invalid specification {}: {e}", spec_path.display()))
            })?;
            spec.verify(&source, &artifact, &evaluator, &FilterRegistry::new())?
        }
        None => {
            let provided = ProvidedContext::syntax_only();
            LoadResult {
                invalid_tests: ConsistencyValidator::new(&evaluator, &provided)
                    .verify_all(&source, &artifact),
                ..LoadResult::default()
            }
        }
    };

    println!("{}", output::format_report(&artifact, &result));
    if result.has_invalid_tests() || result.has_missing_tests() {
        return Err(AppError::Validation(format!(
            "{source}: {} invalid and {} missing tests",
            result.invalid_tests.len(),
            result.missing_tests.len()
        )));
    }
    Ok(())
}

struct ResolveRequest {
    identifiers: Identifiers,
    context: Context,
    requested: RequestedTests,
    force: ForceGroups,
}

fn resolve(artifact_path: &Path, request: &ResolveRequest) -> Result<String> {
    let artifact = Arc::new(ArtifactLoader::new()?.load(artifact_path)?);
    let result = Resolver::default().resolve_with(
        &artifact,
        &request.identifiers,
        &request.context,
        &request.requested,
        &request.force,
    );
    Ok(serde_json::to_string_pretty(&result)?)
}

fn split_pair<'a>(arg: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    arg.split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .ok_or_else(|| AppError::Validation(format!("Invalid {what} '{arg}': expected KEY=VALUE")))
}

fn parse_identifiers(args: &[String], random: bool) -> Result<Identifiers> {
    let mut ids = Identifiers::new().with_random_enabled(random);
    let mut seen = BTreeSet::new();
    for arg in args {
        let (test_type, value) = split_pair(arg, "identifier")?;
        let test_type = TestType::from(test_type.trim());
        if !seen.insert(test_type.clone()) {
            return Err(AppError::Validation(format!(
                "Identifier for {test_type} given more than once"
            )));
        }
        ids.insert(test_type, value);
    }
    Ok(ids)
}

/// Values that are not valid JSON are taken as plain strings.
fn parse_context(args: &[String]) -> Result<Context> {
    let mut ctx = Context::new();
    for arg in args {
        let (key, raw) = split_pair(arg, "context value")?;
        let value = serde_json::from_str::<ContextValue>(raw)
            .unwrap_or_else(|_| ContextValue::String(raw.to_string()));
        ctx.insert(key.trim(), value);
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DEFINITION: &str = r##"
testType: USER
salt: checkout_tst
rule: "${country == 'US'}"
buckets:
  - name: control
    value: 0
  - name: active
    value: 1
allocations:
  - id: "#A1"
    ranges:
      - bucketValue: 0
        length: 0.5
      - bucketValue: 1
        length: 0.5
"##;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn built_artifact(temp: &TempDir) -> PathBuf {
        let defs = temp.path().join("definitions");
        fs::create_dir_all(&defs).unwrap();
        fs::write(defs.join("checkout_tst.yaml"), DEFINITION).unwrap();
        let out = temp.path().join("out").join("test-matrix.json");
        build(
            defs.to_str().unwrap(),
            &out,
            Some("7".to_string()),
            "dave",
        )
        .unwrap();
        out
    }

    #[test]
    fn test_parse_identifiers() {
        let ids = parse_identifiers(&strings(&["USER=u1", "account=a9"]), false).unwrap();
        assert_eq!(ids.get(&TestType::User), Some("u1"));
        assert_eq!(ids.get(&TestType::Account), Some("a9"));
        assert!(!ids.random_enabled());

        assert!(parse_identifiers(&strings(&["USER"]), false).is_err());
        assert!(parse_identifiers(&strings(&["=x"]), false).is_err());
        assert!(parse_identifiers(&strings(&["USER=a", "user=b"]), false).is_err());
    }

    #[test]
    fn test_parse_context() {
        let ctx = parse_context(&strings(&[
            "country=\"US\"",
            "age=42",
            "beta=true",
            "lang=en",
            "tags=[\"a\",\"b\"]",
        ]))
        .unwrap();
        assert_eq!(ctx.get("country"), Some(&ContextValue::String("US".into())));
        assert_eq!(ctx.get("age"), Some(&ContextValue::Int(42)));
        assert_eq!(ctx.get("beta"), Some(&ContextValue::Bool(true)));
        assert_eq!(ctx.get("lang"), Some(&ContextValue::String("en".into())));
        assert!(matches!(ctx.get("tags"), Some(ContextValue::List(items)) if items.len() == 2));
    }

    #[test]
    fn test_build_validate_resolve() {
        let temp = TempDir::new().unwrap();
        let out = built_artifact(&temp);

        validate(&out, None).unwrap();

        let mut context = Context::new();
        context.insert("country", ContextValue::from("US"));
        let request = ResolveRequest {
            identifiers: Identifiers::new().with(TestType::User, "user1"),
            context,
            requested: RequestedTests::All,
            force: ForceGroups::parse("checkout_tst1"),
        };
        let json: serde_json::Value = serde_json::from_str(&resolve(&out, &request).unwrap()).unwrap();
        assert_eq!(json["version"], "7");
        assert_eq!(json["groups"]["checkout_tst"]["bucket"], "active");
        assert_eq!(json["groups"]["checkout_tst"]["allocation"], "");
    }

    #[test]
    fn test_validate_against_specification() {
        let temp = TempDir::new().unwrap();
        let out = built_artifact(&temp);

        let spec = temp.path().join("spec.json");
        fs::write(
            &spec,
            r#"{"tests": {"checkout_tst": {"buckets": {"active": 1}}}, "providedContext": {"country": "String"}}"#,
        )
        .unwrap();
        validate(&out, Some(spec.as_path())).unwrap();

        fs::write(&spec, r#"{"tests": {"missing_tst": {}}}"#).unwrap();
        let result = validate(&out, Some(spec.as_path()));
        assert!(matches!(result, Err(AppError::Validation(msg)) if msg.contains("1 missing")));
    }

    #[test]
    fn test_validate_rejects_bad_structure() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        fs::write(&path, r#"{"tests": {}}"#).unwrap();
        assert!(matches!(
            validate(&path, None),
            Err(AppError::Artifact(_))
        ));
    }
}
