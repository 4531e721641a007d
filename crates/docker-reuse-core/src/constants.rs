//! Constants used across the docker-reuse workspace.

/// The filename for docker-reuse's optional configuration.
pub const CONFIG_FILE: &str = "docker-reuse.toml";

/// The recipe looked up inside the build context when none is given.
pub const DEFAULT_RECIPE: &str = "Dockerfile";

/// Name of the recipe's own line in the fingerprint, whatever the file is called.
pub const RECIPE_CONTRIBUTOR: &str = "Dockerfile";

/// Default executable for the build/push backend.
pub const DEFAULT_DOCKER: &str = "docker";

/// Environment variable overriding the identity strategy.
pub const ENV_STRATEGY: &str = "DOCKER_REUSE_STRATEGY";

/// Environment variable overriding the backend executable.
pub const ENV_DOCKER: &str = "DOCKER_REUSE_DOCKER";
