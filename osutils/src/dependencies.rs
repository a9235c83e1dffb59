use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io::{self, Write},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command as StdCommand, Output, Stdio},
};

use log::trace;
use strum_macros::IntoStaticStr;

use mirroot_api::error::{
    ConfigurationError, ExecutionEnvironmentError, MirrootError, MirrootResultExt,
};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to find dependency '{dependency}': {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("Failed to execute dependency '{dependency}': {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("Dependency '{dependency}' finished unsuccessfully: {explanation}\nCmdline: {rendered_command}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        rendered_command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        explanation: String,
        output: String,
    },
}

impl From<DependencyError> for MirrootError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        match value {
            DependencyError::NotFound { dependency, source } => MirrootError::with_source(
                ExecutionEnvironmentError::MissingBinary {
                    binary: dependency.name(),
                },
                source.into(),
            ),
            DependencyError::CouldNotExecute { dependency, inner } => MirrootError::with_source(
                ConfigurationError::CommandCouldNotExecute {
                    binary: dependency.name(),
                },
                inner.into(),
            ),
            DependencyError::ExecutionFailed {
                dependency,
                explanation,
                ..
            } => MirrootError::new(ConfigurationError::CommandFailed {
                binary: dependency.name(),
                explanation,
            }),
        }
    }
}

pub trait DependencyResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, MirrootError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, MirrootError> {
        let result: Result<T, MirrootError> = self.map_err(|e| (*e).into());
        result.message(context)
    }
}

/// External tools mirroot drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Chroot,
    Debootstrap,
    Efibootmgr,
    Findmnt,
    #[strum(serialize = "grub-install")]
    GrubInstall,
    #[strum(serialize = "grub-mkconfig")]
    GrubMkconfig,
    Lsblk,
    #[strum(serialize = "mkfs.vfat")]
    MkfsVfat,
    Mkswap,
    Mount,
    Rsync,
    Sfdisk,
    Swapoff,
    Systemctl,
    #[strum(serialize = "systemd-run")]
    SystemdRun,
    Udevadm,
    Umount,
    Wipefs,
    Zfs,
    Zpool,
    // Test dependencies
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Cat,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Tools every installation needs before anything is touched.
    pub const INSTALL: &'static [Dependency] = &[
        Self::Debootstrap,
        Self::Efibootmgr,
        Self::Findmnt,
        Self::Lsblk,
        Self::MkfsVfat,
        Self::Mkswap,
        Self::Mount,
        Self::Rsync,
        Self::Sfdisk,
        Self::Udevadm,
        Self::Umount,
        Self::Wipefs,
        Self::Zfs,
        Self::Zpool,
    ];

    pub const WIPE: &'static [Dependency] = &[
        Self::Lsblk,
        Self::Sfdisk,
        Self::Swapoff,
        Self::Wipefs,
        Self::Zfs,
        Self::Zpool,
    ];

    pub const SYNC: &'static [Dependency] = &[
        Self::Efibootmgr,
        Self::Findmnt,
        Self::GrubInstall,
        Self::Lsblk,
        Self::Mount,
        Self::Rsync,
        Self::Udevadm,
        Self::Umount,
    ];

    pub const REPLACE: &'static [Dependency] = &[
        Self::Lsblk,
        Self::MkfsVfat,
        Self::Mkswap,
        Self::Sfdisk,
        Self::Udevadm,
        Self::Wipefs,
        Self::Zpool,
    ];

    /// Gets the path for a dependency not in $PATH
    fn path_override(&self) -> Option<PathBuf> {
        Some(PathBuf::from(match self {
            Self::Zpool if !Self::in_path("zpool") => "/sbin/zpool",
            Self::Zfs if !Self::in_path("zfs") => "/sbin/zfs",
            _ => return None,
        }))
    }

    fn in_path(name: &str) -> bool {
        which::which(name).is_ok()
    }

    /// Gets the name of the dependency
    ///
    /// For example, Dependency::GrubInstall => "grub-install"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present in the system
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Gets the path of the dependency
    pub fn path(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(match self.path_override() {
            Some(path) => path,
            None => self.name().into(),
        })
        .map_err(|source| {
            Box::new(DependencyError::NotFound {
                dependency: *self,
                source,
            })
        })
    }

    /// Converts the dependency to a new Command instance
    /// (Note this does not create a std::process::Command instance)
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
            envs: vec![],
            stdin: None,
        }
    }
}

pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    stdin: Option<Vec<u8>>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Command
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        self
    }

    /// Feeds `input` to the process on stdin.
    pub fn stdin(&mut self, input: impl Into<Vec<u8>>) -> &mut Command {
        self.stdin = Some(input.into());
        self
    }

    pub fn run_and_check(&self) -> Result<(), Box<DependencyError>> {
        self.output()?.check()
    }

    pub fn output_and_check(&self) -> Result<String, Box<DependencyError>> {
        self.output()?.check_output()
    }

    pub fn render_command(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    pub fn output(&self) -> Result<CommandOutput, Box<DependencyError>> {
        let mut cmd = StdCommand::new(self.dependency.path()?);
        cmd.args(&self.args);
        cmd.envs(self.envs.clone());
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let could_not_execute = |inner| DependencyError::CouldNotExecute {
            dependency: self.dependency,
            inner,
        };
        let output = match &self.stdin {
            None => cmd.output().map_err(could_not_execute)?,
            Some(input) => {
                let mut child = cmd
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(could_not_execute)?;
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(input).map_err(could_not_execute)?;
                }
                child.wait_with_output().map_err(could_not_execute)?
            }
        };
        let output = CommandOutput {
            rendered_command: rendered_command.clone(),
            dependency: self.dependency,
            inner: output,
        };
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    rendered_command: String,
    dependency: Dependency,
    inner: Output,
}

impl CommandOutput {
    /// Checks if the process exited successfully
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error
    pub fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.success() {
            return Ok(());
        }

        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            rendered_command: self.rendered_command.clone(),
            code: self.code(),
            signal: self.signal(),
            stdout: self.output(),
            stderr: self.error_output(),
            explanation: self.explain_exit(),
            output: match self.output_report() {
                s if !s.is_empty() => s,
                _ => "(no output collected)".into(),
            },
        }))
    }

    /// Checks if the process exited successfully and returns the output,
    /// otherwise produces an error with the output
    pub fn check_output(&self) -> Result<String, Box<DependencyError>> {
        self.check()?;
        Ok(self.output())
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mirroot_api::error::ErrorKind;

    #[test]
    fn test_command() {
        Dependency::Echo
            .cmd()
            .arg("Hello, world")
            .run_and_check()
            .unwrap();
        assert_eq!(
            Dependency::Echo
                .cmd()
                .args(["Hello,", "world"])
                .output_and_check()
                .unwrap(),
            "Hello, world\n"
        );
        assert_eq!(
            Dependency::Echo
                .cmd()
                .with_arg("-n")
                .with_arg("a b")
                .render_command(),
            "echo -n 'a b'"
        );
    }

    #[test]
    fn test_stdin() {
        assert_eq!(
            Dependency::Cat
                .cmd()
                .stdin("label: gpt\n")
                .output_and_check()
                .unwrap(),
            "label: gpt\n"
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(Dependency::GrubInstall.name(), "grub-install");
        assert_eq!(Dependency::MkfsVfat.name(), "mkfs.vfat");
        assert_eq!(Dependency::SystemdRun.to_string(), "systemd-run");
        assert_eq!(Dependency::Zpool.name(), "zpool");
    }

    #[test]
    fn test_nonexistent_dep() {
        let output = Dependency::DoesNotExist.cmd().output().unwrap_err();
        assert!(matches!(*output, DependencyError::NotFound { .. }));

        let error: MirrootError = (*output).into();
        assert_eq!(
            error.kind(),
            &ErrorKind::ExecutionEnvironment(ExecutionEnvironmentError::MissingBinary {
                binary: "doesnotexist"
            })
        );
    }

    #[test]
    fn test_failed_command() {
        let output = Dependency::False.cmd().output().unwrap();
        assert!(!output.success());
        assert_eq!(output.code(), Some(1));
        assert_eq!(output.output_report(), "");
        assert_eq!(output.explain_exit(), "exited with status: 1");

        let error = output.check().unwrap_err();
        assert!(matches!(*error, DependencyError::ExecutionFailed { .. }));

        let error = Err::<(), _>(error).message("Failed on purpose").unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Configuration(ConfigurationError::CommandFailed {
                binary: "false",
                explanation: "exited with status: 1".into()
            })
        );
    }
}
