//! Handler for lint runs: the lint configuration participates in the
//! fingerprint even when no input glob covers it.

use std::io;

use camino::Utf8Path;

use super::{shell::hash_matching_files, TaskHandler};

const CONFIG_FILES: &[&str] = &[
    ".eslintrc",
    ".eslintrc.json",
    ".eslintrc.js",
    ".eslintrc.cjs",
    "eslint.config.js",
    "eslint.config.mjs",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct EslintHandler;

impl TaskHandler for EslintHandler {
    fn discover_inputs(
        &self,
        package_root: &Utf8Path,
        inputs: &[String],
        outputs: &[String],
    ) -> io::Result<Vec<(String, String)>> {
        let mut entries = hash_matching_files(package_root, inputs, outputs)?;
        for config in CONFIG_FILES {
            let path = package_root.join(config);
            if path.is_file() && !entries.iter().any(|(existing, _)| existing == config) {
                let hash = hoist_hash::hash_file(path.as_std_path())?;
                entries.push(((*config).to_owned(), hash));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn discover_outputs(&self, outputs: &[String]) -> Vec<String> {
        outputs.to_vec()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_lint_config_is_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        for (path, contents) in [("src/index.ts", "x"), (".eslintrc.json", "{}")] {
            let file = root.join(path);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, contents).unwrap();
        }

        let inputs = EslintHandler
            .discover_inputs(root, &["src/**".to_owned()], &[])
            .unwrap();
        let paths: Vec<&str> = inputs.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec![".eslintrc.json", "src/index.ts"]);
    }
}
