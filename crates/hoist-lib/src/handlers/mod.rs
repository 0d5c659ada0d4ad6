//! Per-tool task handlers.
//!
//! Different tools want different fingerprint inputs: a TypeScript build
//! cares about `tsconfig.json` and produces `.tsbuildinfo` sidecars, a lint
//! run cares about its config files. A [`TaskHandler`] encapsulates that
//! knowledge; the [`HandlerRegistry`] picks one from the command's
//! executable, falling back to the generic shell handler for anything it
//! doesn't recognize.

mod eslint;
mod shell;
mod tsc;

use std::{collections::HashMap, io};

use camino::Utf8Path;
pub use eslint::EslintHandler;
pub use shell::{expand_globs, ShellHandler};
pub use tsc::TscHandler;

pub trait TaskHandler: Send + Sync {
    /// Discover and hash the task's input files. Returns package-relative
    /// `(path, content hash)` pairs.
    fn discover_inputs(
        &self,
        package_root: &Utf8Path,
        inputs: &[String],
        outputs: &[String],
    ) -> io::Result<Vec<(String, String)>>;

    /// The output glob patterns to collect after a run, package-relative.
    fn discover_outputs(&self, outputs: &[String]) -> Vec<String>;

    /// Extra strings folded into the command portion of the fingerprint,
    /// e.g. normalized tool flags.
    fn command_fingerprint_extras(&self, _command: &str) -> Vec<String> {
        Vec::new()
    }
}

type HandlerConstructor = fn() -> Box<dyn TaskHandler>;

pub struct HandlerRegistry {
    constructors: HashMap<&'static str, HandlerConstructor>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut constructors: HashMap<&'static str, HandlerConstructor> = HashMap::new();
        constructors.insert("tsc", || Box::new(TscHandler::default()));
        constructors.insert("eslint", || Box::new(EslintHandler::default()));
        Self { constructors }
    }
}

impl HandlerRegistry {
    pub fn handler_for(&self, command: &str) -> Box<dyn TaskHandler> {
        let executable = executable_name(command);
        match self.constructors.get(executable.as_str()) {
            Some(constructor) => constructor(),
            None => Box::new(ShellHandler::default()),
        }
    }
}

/// The normalized executable identifier: first token of the command, with
/// any directory prefix and Windows extension stripped.
pub fn executable_name(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or("");
    let basename = first
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(first)
        .to_ascii_lowercase();
    basename
        .strip_suffix(".exe")
        .or_else(|| basename.strip_suffix(".cmd"))
        .unwrap_or(&basename)
        .to_owned()
}
