//! CLI subcommands.

pub mod run;
pub mod validate;

use std::path::Path;

use search_bench_core::model::BenchmarkDefinition;

use crate::error::CliError;

/// Load a benchmark definition from a JSON or YAML file
pub fn load_definition(path: &Path) -> Result<BenchmarkDefinition, CliError> {
    if !path.exists() {
        return Err(CliError::user(format!(
            "definition file not found: {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CliError::user(format!("cannot read {}: {e}", path.display())))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| CliError::user(format!("malformed YAML definition: {e}")))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| CliError::user(format!("malformed JSON definition: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_load_json_definition() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"benchmark_id": "b1", "num_executor_nodes": 1,
                "competitions": [{{"name": "c1", "requests": [{{"body": {{"query": "*"}}}}]}}]}}"#
        )
        .unwrap();

        let definition = load_definition(file.path()).unwrap();
        assert_eq!(definition.benchmark_id, "b1");
        assert_eq!(definition.competitions.len(), 1);
    }

    #[test]
    fn test_load_yaml_definition() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "benchmark_id: b1\nnum_executor_nodes: 2\ncompetitions:\n  - name: c1\n    requests:\n      - body:\n          query: '*'\n"
        )
        .unwrap();

        let definition = load_definition(file.path()).unwrap();
        assert_eq!(definition.num_executor_nodes, 2);
    }

    #[test]
    fn test_missing_file_is_user_error() {
        let err = load_definition(Path::new("/does/not/exist.json")).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::exit_codes::USER_ERROR);
    }
}
