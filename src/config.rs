//! Reading of YAML/JSON configuration trees: cruise definitions, device
//! definitions and pipeline specs. Files may pull in further files through
//! an `includes` key (string or list, glob wildcards allowed); included
//! content is deep-merged underneath the including file.

use globset::GlobBuilder;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("configuration file not found: {0:?}")]
	NotFound(PathBuf),
	#[error("error reading configuration file {0:?}")]
	Io(PathBuf, #[source] std::io::Error),
	#[error("invalid YAML/JSON syntax in {0:?}: {1}")]
	Syntax(PathBuf, String),
	#[error("invalid include pattern {0:?}: {1}")]
	BadIncludePattern(String, String),
	#[error("top-level value of {0:?} in {1:?} must be a mapping")]
	NotAMapping(&'static str, PathBuf),
	#[error("{0}")]
	Invalid(String),
}

/// Read a configuration file, resolving any `includes` recursively.
pub fn read_config(path: &Path) -> Result<Value, ConfigError> {
	if !path.is_file() {
		return Err(ConfigError::NotFound(path.to_owned()));
	}
	let content =
		std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;
	parse(&content, path)
}

/// Parse configuration content, resolving `includes` relative to the
/// containing file's directory before merging sibling keys on top.
pub fn parse(content: &str, path: &Path) -> Result<Value, ConfigError> {
	// YAML is a superset of JSON, so one parser covers both file kinds.
	let parsed: serde_yaml::Value = serde_yaml::from_str(content)
		.map_err(|e| ConfigError::Syntax(path.to_owned(), e.to_string()))?;
	let mut data = serde_json::to_value(parsed)
		.map_err(|e| ConfigError::Syntax(path.to_owned(), e.to_string()))?;
	if data.is_null() {
		return Ok(Value::Object(Default::default()));
	}

	let includes = match &mut data {
		Value::Object(map) => map.remove("includes"),
		_ => None,
	};
	let includes = match includes {
		Some(includes) => includes,
		None => return Ok(data),
	};

	let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_owned();
	let patterns: Vec<String> = match includes {
		Value::String(s) => vec![s],
		Value::Array(items) => items
			.into_iter()
			.filter_map(|v| match v {
				Value::String(s) => Some(s),
				other => {
					warn!("Ignoring non-string include entry: {}", other);
					None
				}
			})
			.collect(),
		other => {
			warn!("Ignoring non-string/list includes value: {}", other);
			vec![]
		}
	};

	let mut included = Value::Object(Default::default());
	for pattern in patterns {
		for include_path in expand_wildcards(&pattern, &base_dir)? {
			let content = read_config(&include_path)?;
			included = deep_merge(included, content);
		}
	}

	// The including file wins over whatever it pulled in.
	Ok(deep_merge(included, data))
}

/// Expand a possibly-wildcarded path specification into matching files.
/// Relative patterns are resolved against `base_dir`.
pub fn expand_wildcards(pattern: &str, base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
	let full: PathBuf = if Path::new(pattern).is_absolute() {
		PathBuf::from(pattern)
	} else {
		base_dir.join(pattern)
	};

	let full_str = full.to_string_lossy().to_string();
	if !full_str.contains(|c| c == '*' || c == '?' || c == '[') {
		if full.is_file() {
			return Ok(vec![full]);
		}
		warn!("No files found matching pattern: {:?}", pattern);
		return Ok(vec![]);
	}

	let matcher = GlobBuilder::new(&full_str)
		.literal_separator(true)
		.build()
		.map_err(|e| ConfigError::BadIncludePattern(pattern.to_owned(), e.to_string()))?
		.compile_matcher();

	// Walk from the longest literal directory prefix of the pattern.
	let mut root = PathBuf::new();
	for component in full.components() {
		let as_str = component.as_os_str().to_string_lossy();
		if as_str.contains(|c| c == '*' || c == '?' || c == '[') {
			break;
		}
		root.push(component);
	}
	if root.as_os_str().is_empty() {
		root = PathBuf::from(".");
	}

	let mut matches = Vec::new();
	collect_matches(&root, &matcher, &mut matches);
	matches.sort();
	if matches.is_empty() {
		warn!("No files found matching pattern: {:?}", pattern);
	}
	Ok(matches)
}

fn collect_matches(dir: &Path, matcher: &globset::GlobMatcher, out: &mut Vec<PathBuf>) {
	let entries = match std::fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) => {
			debug!("Unable to read directory {:?}: {}", dir, e);
			return;
		}
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.is_dir() {
			collect_matches(&path, matcher, out);
		} else if matcher.is_match(&path) {
			out.push(path);
		}
	}
}

/// Deep-merge `overlay` onto `base`: mappings merge recursively, lists
/// append, scalars overwrite.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
	match (base, overlay) {
		(Value::Object(mut base_map), Value::Object(overlay_map)) => {
			for (key, value) in overlay_map {
				match base_map.remove(&key) {
					Some(existing) => {
						base_map.insert(key, deep_merge(existing, value));
					}
					None => {
						base_map.insert(key, value);
					}
				}
			}
			Value::Object(base_map)
		}
		(Value::Array(mut base_list), Value::Array(overlay_list)) => {
			base_list.extend(overlay_list);
			Value::Array(base_list)
		}
		(_, overlay) => overlay,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
		let path = dir.join(name);
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(content.as_bytes()).unwrap();
		path
	}

	#[test]
	fn merges_scalars_lists_and_maps() {
		let base = serde_json::json!({
			"a": 1,
			"list": [1, 2],
			"nested": {"x": 1, "y": 2}
		});
		let overlay = serde_json::json!({
			"a": 9,
			"list": [3],
			"nested": {"y": 7, "z": 8}
		});
		let merged = deep_merge(base, overlay);
		assert_eq!(
			merged,
			serde_json::json!({
				"a": 9,
				"list": [1, 2, 3],
				"nested": {"x": 1, "y": 7, "z": 8}
			})
		);
	}

	#[test]
	fn resolves_includes_with_globs() {
		let dir = tempfile::tempdir().unwrap();
		write_file(dir.path(), "one.yaml", "devices:\n  gyr1:\n    device_type: Gyro\n");
		write_file(dir.path(), "two.yaml", "devices:\n  s330:\n    device_type: Seapath\n");
		let top = write_file(
			dir.path(),
			"top.yaml",
			"includes:\n  - '*e.yaml'\n  - two.yaml\ndevices:\n  gyr1:\n    device_type: Gyro2\n",
		);

		let config = read_config(&top).unwrap();
		let devices = config["devices"].as_object().unwrap();
		// Including file overrides included content.
		assert_eq!(devices["gyr1"]["device_type"], "Gyro2");
		assert_eq!(devices["s330"]["device_type"], "Seapath");
	}

	#[test]
	fn accepts_json_content() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_file(dir.path(), "c.json", r#"{"loggers": {"gyr1": {"configs": []}}}"#);
		let config = read_config(&path).unwrap();
		assert!(config["loggers"]["gyr1"]["configs"].is_array());
	}

	#[test]
	fn empty_file_yields_empty_mapping() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_file(dir.path(), "empty.yaml", "");
		assert_eq!(read_config(&path).unwrap(), serde_json::json!({}));
	}

	#[test]
	fn missing_file_is_an_error() {
		assert!(matches!(
			read_config(Path::new("/nonexistent/nope.yaml")),
			Err(ConfigError::NotFound(_))
		));
	}
}
