//! Sandbox identity and launch specification.
//!
//! The launcher turns a client's declared command, arguments and environment
//! into a complete, reproducible launch specification:
//!
//! - the sandbox name (`prefix + client + "-" + epoch seconds`)
//! - the entry point (working directory and script, resolved from the args)
//! - bind mount of the host code root onto the sandbox code root
//! - merged environment (interpreter flags, sandbox defaults, user overrides)
//! - a fail-fast bootstrap script wrapped so output is duplicated to stderr
//!
//! Nothing here touches the registry or the runtime.

use crate::config::{ClientConfig, HarnessConfig};
use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Flag naming the working directory in a client's arguments.
pub const DIRECTORY_FLAG: &str = "--directory";

/// Dependency manifest installed by the bootstrap script when present.
pub const DEPENDENCY_MANIFEST: &str = "requirements.txt";

/// Path component marking the start of a project's sources.
const SOURCE_DIR: &str = "src";

/// Command used when a client declares none.
const DEFAULT_COMMAND: &str = "python";

/// Settings shared by every launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSettings {
    /// Sandbox image reference.
    pub image: String,
    /// Prefix for sandbox names.
    pub name_prefix: String,
    /// Code root inside the sandbox.
    pub sandbox_code_root: String,
    /// Extension identifying the script argument.
    pub source_extension: String,
    /// Environment-customization script, pasted verbatim into the bootstrap.
    pub env_script: String,
    /// Container CLI binary used to run sandboxes.
    pub cli: String,
}

impl LauncherSettings {
    /// Builds launcher settings from the harness configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the env script file cannot be read.
    pub fn from_config(config: &HarnessConfig, cli: impl Into<String>) -> Result<Self> {
        Ok(Self {
            image: config.image.clone(),
            name_prefix: config.name_prefix.clone(),
            sandbox_code_root: config.sandbox_code_root.clone(),
            source_extension: config.source_extension.clone(),
            env_script: config.env_script()?,
            cli: cli.into(),
        })
    }
}

impl Default for LauncherSettings {
    fn default() -> Self {
        let config = HarnessConfig::default();
        Self {
            image: config.image,
            name_prefix: config.name_prefix,
            sandbox_code_root: config.sandbox_code_root,
            source_extension: config.source_extension,
            env_script: String::new(),
            cli: crate::runtime::DOCKER_CLI.to_string(),
        }
    }
}

/// Resolved entry point of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Working directory the script path is relative to.
    pub working_dir: PathBuf,
    /// Absolute path of the script on the host.
    pub script: PathBuf,
    /// Host directory mounted into the sandbox.
    pub code_root: PathBuf,
    /// Script path relative to the code root.
    pub relative_script: PathBuf,
}

/// Bind mount of a host path into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host path.
    pub source: PathBuf,
    /// Sandbox path.
    pub target: String,
    /// Read-only mount.
    pub read_only: bool,
}

impl BindMount {
    fn to_volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Sandbox name (the identity).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Working directory inside the sandbox.
    pub working_dir: String,
    /// Bind mounts.
    pub mounts: Vec<BindMount>,
    /// Environment, already merged.
    pub env: BTreeMap<String, String>,
    /// Remove the sandbox when it exits.
    pub remove_on_exit: bool,
    /// Streams attached to the caller.
    pub attach: Vec<String>,
    /// Bootstrap script run by `bash -c`.
    pub bootstrap: String,
}

impl ContainerSpec {
    /// Returns the `run` argument vector for a docker-compatible CLI.
    #[must_use]
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if self.remove_on_exit {
            args.push("--rm".to_string());
        }
        args.push("-i".to_string());
        args.extend(["--name".to_string(), self.name.clone()]);
        args.extend(["--workdir".to_string(), self.working_dir.clone()]);
        for mount in &self.mounts {
            args.extend(["-v".to_string(), mount.to_volume_arg()]);
        }
        for (key, value) in &self.env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        for stream in &self.attach {
            args.extend(["-a".to_string(), stream.clone()]);
        }
        args.push(self.image.clone());
        args.extend([
            "bash".to_string(),
            "-c".to_string(),
            self.bootstrap.clone(),
        ]);
        args
    }
}

/// Command line that starts a client, plus the sandbox it creates (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Program to execute.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Environment overlay for host launches.
    pub host_env: Option<BTreeMap<String, String>>,
    /// The sandbox created by this launch.
    pub container: Option<ContainerSpec>,
}

impl LaunchSpec {
    /// Returns the sandbox name, if this launch creates one.
    #[must_use]
    pub fn sandbox_name(&self) -> Option<&str> {
        self.container.as_ref().map(|c| c.name.as_str())
    }

    /// Returns the command line for logging.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds sandbox identities and launch specifications.
#[derive(Debug, Clone, Default)]
pub struct Launcher {
    settings: LauncherSettings,
}

impl Launcher {
    /// Creates a launcher.
    #[must_use]
    pub fn new(settings: LauncherSettings) -> Self {
        Self { settings }
    }

    /// Returns the launcher settings.
    #[must_use]
    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Returns the sandbox name for a client launched at `epoch_secs`.
    ///
    /// Two launches of the same client within one second produce the same
    /// name; the registry disambiguates live collisions.
    #[must_use]
    pub fn sandbox_name(&self, client: &str, epoch_secs: i64) -> String {
        format!("{}{client}-{epoch_secs}", self.settings.name_prefix)
    }

    /// Resolves a client's entry point against the current directory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no script argument is present or the
    /// script does not exist.
    pub fn resolve(&self, config: &ClientConfig) -> Result<EntryPoint> {
        let cwd = std::env::current_dir()?;
        resolve_entry_point(&config.args, &self.settings.source_extension, &cwd)
    }

    /// Builds the launch specification of a containerized client.
    #[must_use]
    pub fn container_spec(&self, name: &str, entry: &EntryPoint, config: &ClientConfig) -> LaunchSpec {
        let run_command = run_command(&config.command, &entry.relative_script);
        let bootstrap = tee_output(&self.bootstrap_script(&run_command));

        let container = ContainerSpec {
            name: name.to_string(),
            image: self.settings.image.clone(),
            working_dir: self.settings.sandbox_code_root.clone(),
            mounts: vec![BindMount {
                source: entry.code_root.clone(),
                target: self.settings.sandbox_code_root.clone(),
                read_only: false,
            }],
            env: self.sandbox_env(config),
            remove_on_exit: true,
            attach: vec!["stdout".to_string(), "stderr".to_string()],
            bootstrap,
        };

        LaunchSpec {
            program: self.settings.cli.clone(),
            args: container.run_args(),
            host_env: None,
            container: Some(container),
        }
    }

    /// Builds the launch specification of a client run directly on the host.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the client declares no command.
    pub fn host_spec(&self, config: &ClientConfig) -> Result<LaunchSpec> {
        if config.command.trim().is_empty() {
            return Err(SandboxError::config("host launch requires a command"));
        }
        Ok(LaunchSpec {
            program: config.command.clone(),
            args: config.args.clone(),
            host_env: Some(config.env.clone()),
            container: None,
        })
    }

    /// Environment inside the sandbox; user overrides win on collision.
    fn sandbox_env(&self, config: &ClientConfig) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            (
                "PYTHONPATH".to_string(),
                self.settings.sandbox_code_root.clone(),
            ),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PIP_ROOT_USER_ACTION".to_string(), "ignore".to_string()),
        ]);
        env.extend(config.env.clone());
        env
    }

    /// Returns the fail-fast bootstrap script ending in `exec run_command`.
    #[must_use]
    pub fn bootstrap_script(&self, run_command: &str) -> String {
        format!(
            r#"set -e

echo "=== sandbox bootstrap ==="
echo "python: $(python --version 2>&1)"
echo "workdir: $(pwd)"
ls -la
echo ""

echo "=== dependencies ==="
if [ -f {manifest} ]; then
    echo "installing {manifest}"
    pip install -qq --upgrade-strategy only-if-needed -r {manifest}
else
    echo "no {manifest} found"
fi

echo "=== environment customization ==="
{env_script}

echo "=== starting tool server ==="
echo "command: {run_command}"
exec {run_command}"#,
            manifest = DEPENDENCY_MANIFEST,
            env_script = self.settings.env_script,
        )
    }
}

/// Resolves the working directory and script from a client's arguments.
///
/// The working directory is the value following `--directory` (relative to
/// `cwd`), or `cwd` itself. The script is the first argument ending in
/// `extension`.
///
/// # Errors
///
/// Returns a configuration error if no argument ends in `extension` or the
/// resolved script does not exist.
pub fn resolve_entry_point(args: &[String], extension: &str, cwd: &Path) -> Result<EntryPoint> {
    let working_dir = args
        .iter()
        .position(|arg| arg == DIRECTORY_FLAG)
        .and_then(|i| args.get(i + 1))
        .map_or_else(|| cwd.to_path_buf(), |dir| cwd.join(dir));

    let source = args
        .iter()
        .find(|arg| arg.ends_with(extension))
        .ok_or_else(|| {
            SandboxError::config(format!("no argument ends in {extension}: {args:?}"))
        })?;

    let script = working_dir.join(source);
    if !script.is_file() {
        return Err(SandboxError::config(format!(
            "script does not exist: {}",
            script.display()
        )));
    }

    let (code_root, relative_script) = split_code_root(&script);
    Ok(EntryPoint {
        working_dir,
        script,
        code_root,
        relative_script,
    })
}

/// Splits a script path at its first `src` component.
///
/// `/work/proj/src/pkg/server.py` → (`/work/proj`, `src/pkg/server.py`).
/// Without a `src` component the script's directory is the code root.
fn split_code_root(script: &Path) -> (PathBuf, PathBuf) {
    let components: Vec<Component<'_>> = script.components().collect();
    let split_at = components
        .iter()
        .position(|c| c.as_os_str() == SOURCE_DIR)
        .unwrap_or(components.len().saturating_sub(1));

    let root: PathBuf = components[..split_at].iter().collect();
    let relative: PathBuf = components[split_at..].iter().collect();
    (root, relative)
}

/// Returns the command executed inside the sandbox.
fn run_command(command: &str, relative_script: &Path) -> String {
    let command = match command.trim() {
        "" => DEFAULT_COMMAND,
        "uv" => "uv run",
        other => other,
    };
    format!("{command} {}", relative_script.display())
}

/// Wraps a script so its output is duplicated to stderr.
///
/// Standard output is teed into the error stream (shown on the outer
/// terminal) while still reaching the control channel, and standard error is
/// folded into the same pipe.
#[must_use]
pub fn tee_output(script: &str) -> String {
    format!("exec > >(tee /dev/stderr)\nexec 2>&1\n\n{script}\n")
}
