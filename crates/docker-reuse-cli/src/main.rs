use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use docker_reuse_core::constants::{CONFIG_FILE, DEFAULT_DOCKER, ENV_DOCKER, ENV_STRATEGY};
use docker_reuse_core::{compute_fingerprint, IdentityResolver, ReuseConfig, Strategy, Template};
use tracing::{debug, info, instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod executor;
mod styles;

use executor::{BuildRequest, DockerBackend};
use styles as s;

/// The command-line interface for docker-reuse.
#[derive(Debug, Parser)]
#[command(name = "docker-reuse")]
#[command(version)]
#[command(styles = s::get_clap_styles())]
#[command(about = "Find or build a Docker image tagged with the fingerprint of its inputs")]
#[command(
    long_about = "docker-reuse computes a fingerprint over a Dockerfile, every file it copies
into the image and the build arguments, and uses it as the image tag. If the
registry already has that tag the build is skipped; otherwise the image is
built and pushed. Finally the image reference in FILE is rewritten to the
fingerprinted tag, so unchanged sources never cause a rebuild or a diff."
)]
#[command(
    after_help = "\x1b[1;32mExamples:\x1b[0m\n  \x1b[36mdocker-reuse . registry.example.com/app k8s/deploy.yaml\x1b[0m\n  \x1b[36mdocker-reuse -f docker/Dockerfile --build-arg VERSION svc/ app values.yaml\x1b[0m\n  \x1b[36mdocker-reuse --print-fingerprint .\x1b[0m"
)]
pub(crate) struct Cli {
    /// Docker build context directory
    path: PathBuf,
    /// Name of the image to find or build, without a tag
    #[arg(required_unless_present = "print_fingerprint")]
    image: Option<String>,
    /// File to update with the new image tag
    #[arg(value_name = "FILE", required_unless_present = "print_fingerprint")]
    template: Option<PathBuf>,
    /// Pathname of the Dockerfile (default is 'PATH/Dockerfile')
    #[arg(short = 'f', long = "file", value_name = "DOCKERFILE")]
    dockerfile: Option<PathBuf>,
    /// Suppress build output
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
    /// Additional tag to apply to a freshly built image (repeatable)
    #[arg(short = 't', long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Build argument; a bare NAME is read from the environment (repeatable, order matters)
    #[arg(long = "build-arg", value_name = "NAME[=VALUE]")]
    build_args: Vec<String>,
    /// Exact text in FILE to replace instead of references to IMAGE
    #[arg(short, long)]
    placeholder: Option<String>,
    /// How source identities are computed: auto, version-control or content-digest
    #[arg(long, env = ENV_STRATEGY)]
    strategy: Option<Strategy>,
    /// Path to a docker-reuse config file (default: ./docker-reuse.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Executable used to build, push and inspect images
    #[arg(long, env = ENV_DOCKER)]
    docker: Option<String>,
    /// Print the fingerprint and exit without building or touching FILE
    #[arg(long, default_value_t = false)]
    print_fingerprint: bool,
}

/// Command-line flags merged over the config file.
#[derive(Debug)]
struct Settings {
    context: PathBuf,
    image: Option<String>,
    template: Option<PathBuf>,
    dockerfile: Option<PathBuf>,
    quiet: bool,
    tags: Vec<String>,
    build_args: Vec<String>,
    placeholder: Option<String>,
    strategy: Strategy,
    docker: String,
    print_fingerprint: bool,
}

impl Settings {
    fn merge(cli: Cli, cfg: ReuseConfig) -> Self {
        let build = cfg.build;
        Self {
            context: cli.path,
            image: cli.image,
            template: cli.template,
            dockerfile: cli.dockerfile.or(build.dockerfile),
            quiet: cli.quiet || build.quiet,
            tags: if cli.tags.is_empty() {
                build.tags
            } else {
                cli.tags
            },
            build_args: if cli.build_args.is_empty() {
                build.args
            } else {
                cli.build_args
            },
            placeholder: cli.placeholder.or(build.placeholder),
            strategy: cli.strategy.unwrap_or(cfg.fingerprint.strategy),
            docker: cli
                .docker
                .or(build.docker)
                .unwrap_or_else(|| DEFAULT_DOCKER.to_string()),
            print_fingerprint: cli.print_fingerprint,
        }
    }
}

/// What a find-or-build run did.
#[derive(Debug, PartialEq, Eq)]
struct Outcome {
    target: String,
    built: bool,
    template_changed: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let settings = Settings::merge(cli, cfg);

    init_tracing(settings.quiet);
    debug!("resolved settings: {:?}", settings);

    let resolver = IdentityResolver::new(settings.strategy);

    if settings.print_fingerprint {
        let fingerprint = compute_fingerprint(
            &settings.context,
            settings.dockerfile.as_deref(),
            &settings.build_args,
            &resolver,
        )?;
        println!("{fingerprint}");
        return Ok(());
    }

    let backend = DockerBackend::new(settings.docker.clone(), settings.quiet);
    find_or_build_and_push(&settings, &resolver, &backend)?;
    Ok(())
}

fn init_tracing(quiet: bool) {
    let level = if quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<ReuseConfig> {
    match explicit {
        Some(path) => ReuseConfig::load_from_file(path)
            .with_context(|| format!("unable to load config '{}'", path.display())),
        None => ReuseConfig::load_optional(Path::new(CONFIG_FILE))
            .with_context(|| format!("unable to load config '{}'", CONFIG_FILE)),
    }
}

/// Fingerprints the build, reuses or builds and pushes the image, and points
/// the template at it.
///
/// The template is validated before the fingerprint is computed, so an
/// inconsistent template never triggers a build.
#[instrument(skip_all, fields(context = %settings.context.display()))]
fn find_or_build_and_push(
    settings: &Settings,
    resolver: &IdentityResolver,
    backend: &DockerBackend,
) -> Result<Outcome> {
    let image = settings
        .image
        .as_deref()
        .context("an image name is required")?;
    let template_path = settings
        .template
        .as_deref()
        .context("a file to update is required")?;

    let mut template = Template::load(template_path)?;
    let placeholder = template.locate(settings.placeholder.as_deref(), image)?;

    let fingerprint = compute_fingerprint(
        &settings.context,
        settings.dockerfile.as_deref(),
        &settings.build_args,
        resolver,
    )
    .with_context(|| {
        format!(
            "unable to fingerprint build context '{}'",
            settings.context.display()
        )
    })?;

    let target = format!("{image}:{fingerprint}");
    if !settings.quiet {
        println!("Target image: {}", s::paint(s::IMAGE, &target));
    }

    let built = if backend.image_exists(&target)? {
        if !settings.quiet {
            println!("{}", s::paint(s::NOTICE, "Image already exists"));
        }
        if !settings.tags.is_empty() {
            info!(
                "image exists, additional tags {:?} are only applied to new builds",
                settings.tags
            );
        }
        false
    } else {
        let mut tags = vec![target.clone()];
        tags.extend(settings.tags.iter().map(|tag| format!("{image}:{tag}")));

        backend
            .build(&BuildRequest {
                context: &settings.context,
                dockerfile: settings.dockerfile.as_deref(),
                tags: &tags,
                build_args: fingerprint.build_args(),
            })
            .with_context(|| format!("failed to build '{target}'"))?;
        for tag in &tags {
            backend
                .push(tag)
                .with_context(|| format!("failed to push '{tag}'"))?;
        }
        true
    };

    let template_changed = template.write_tag(&placeholder, &target)?;
    if template_changed {
        info!("updated {} to {}", template_path.display(), target);
    } else {
        debug!("{} already references {}", template_path.display(), target);
    }

    Ok(Outcome {
        target,
        built,
        template_changed,
    })
}
