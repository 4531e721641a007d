use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use docker_reuse_core::BuildArg;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to start '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command failed with {status}: {command}")]
    Failed { command: String, status: ExitStatus },
    #[error("unable to check whether '{image}' exists ({status}): {stderr}")]
    Infrastructure {
        image: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Everything `docker build` needs for one image.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub context: &'a Path,
    pub dockerfile: Option<&'a Path>,
    /// Fully qualified references; the first one is the fingerprint tag.
    pub tags: &'a [String],
    pub build_args: &'a [BuildArg],
}

/// Build, push and registry lookups through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    program: String,
    quiet: bool,
}

impl DockerBackend {
    pub fn new(program: impl Into<String>, quiet: bool) -> Self {
        Self {
            program: program.into(),
            quiet,
        }
    }

    /// Asks the registry whether `image` already exists.
    ///
    /// # Errors
    /// A failure that is not the registry saying "no such manifest" is an
    /// infrastructure error, never a "does not exist".
    #[instrument(skip(self))]
    pub fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        let output = Command::new(&self.program)
            .args(["manifest", "inspect", image])
            .stdin(Stdio::null())
            .output()
            .map_err(|source| DockerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if reports_missing_manifest(&stderr) {
            debug!("registry has no manifest for {}", image);
            return Ok(false);
        }

        Err(DockerError::Infrastructure {
            image: image.to_string(),
            status: output.status,
            stderr,
        })
    }

    pub fn build(&self, request: &BuildRequest<'_>) -> Result<(), DockerError> {
        self.run(&build_argv(request, self.quiet))
    }

    pub fn push(&self, image: &str) -> Result<(), DockerError> {
        let mut args = vec!["push".to_string(), image.to_string()];
        if self.quiet {
            args.push("-q".to_string());
        }
        self.run(&args)
    }

    fn run(&self, args: &[String]) -> Result<(), DockerError> {
        let command = format!("{} {}", self.program, args.join(" "));
        if !self.quiet {
            info!(target: "docker-reuse", "Run: {}", command);
        }

        let stdout = if self.quiet {
            Stdio::null()
        } else {
            Stdio::inherit()
        };
        let status = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| DockerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(DockerError::Failed { command, status });
        }
        Ok(())
    }
}

fn build_argv(request: &BuildRequest<'_>, quiet: bool) -> Vec<String> {
    let mut argv = vec![
        "build".to_string(),
        request.context.display().to_string(),
    ];

    for tag in request.tags {
        argv.push("-t".to_string());
        argv.push(tag.clone());
    }
    if let Some(dockerfile) = request.dockerfile {
        argv.push("-f".to_string());
        argv.push(dockerfile.display().to_string());
    }
    for arg in request.build_args {
        argv.push("--build-arg".to_string());
        argv.push(arg.to_string());
    }
    if quiet {
        argv.push("-q".to_string());
    }

    argv
}

fn reports_missing_manifest(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such manifest")
        || lower.contains("manifest unknown")
        || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn mock_docker(dir: &TempDir, script: &str) -> String {
        let path = dir.path().join("docker");
        fs::write(&path, format!("#!/usr/bin/env sh\n{script}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn arg(name: &str, value: &str) -> BuildArg {
        BuildArg {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn build_argv_carries_tags_recipe_and_args() {
        let tags = vec!["app:abc".to_string(), "app:latest".to_string()];
        let args = vec![arg("VERSION", "1"), arg("CHANNEL", "beta")];
        let request = BuildRequest {
            context: Path::new("ctx"),
            dockerfile: Some(Path::new("ctx/build.Dockerfile")),
            tags: &tags,
            build_args: &args,
        };

        let argv = build_argv(&request, true);
        assert_eq!(
            argv,
            vec![
                "build",
                "ctx",
                "-t",
                "app:abc",
                "-t",
                "app:latest",
                "-f",
                "ctx/build.Dockerfile",
                "--build-arg",
                "VERSION=1",
                "--build-arg",
                "CHANNEL=beta",
                "-q",
            ]
        );
    }

    #[test]
    fn build_argv_without_options() {
        let tags = vec!["app:abc".to_string()];
        let request = BuildRequest {
            context: Path::new("."),
            dockerfile: None,
            tags: &tags,
            build_args: &[],
        };
        assert_eq!(build_argv(&request, false), vec!["build", ".", "-t", "app:abc"]);
    }

    #[test]
    fn existing_manifest_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let docker = mock_docker(&dir, "exit 0");
        assert!(DockerBackend::new(docker, true).image_exists("app:abc").unwrap());
    }

    #[test]
    fn missing_manifest_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let docker = mock_docker(&dir, "echo \"no such manifest: $3\" >&2\nexit 1");
        assert!(!DockerBackend::new(docker, true).image_exists("app:abc").unwrap());
    }

    #[test]
    fn other_failures_are_infrastructure_errors() {
        let dir = tempfile::tempdir().unwrap();
        let docker = mock_docker(
            &dir,
            "echo 'Cannot connect to the Docker daemon at unix:///var/run/docker.sock' >&2\nexit 1",
        );
        let err = DockerBackend::new(docker, true)
            .image_exists("app:abc")
            .expect_err("must fail");
        assert!(matches!(err, DockerError::Infrastructure { .. }));
    }

    #[test]
    fn missing_program_cannot_spawn() {
        let err = DockerBackend::new("definitely-not-docker-4242", true)
            .image_exists("app:abc")
            .expect_err("must fail");
        assert!(matches!(err, DockerError::Spawn { .. }));
    }

    #[test]
    fn failed_push_reports_command() {
        let dir = tempfile::tempdir().unwrap();
        let docker = mock_docker(&dir, "exit 3");
        let err = DockerBackend::new(docker, true)
            .push("app:abc")
            .expect_err("must fail");
        match err {
            DockerError::Failed { command, .. } => assert!(command.ends_with("push app:abc -q")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
