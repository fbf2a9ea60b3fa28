//! Image and host constants.
//!
//! Centralized location for well-known paths, labels and variable names.

/// Paths inside the image root filesystem.
pub mod image_paths {
    /// Directory holding locally added CA certificates.
    pub const LOCAL_CA_DIR: &str = "/usr/local/share/ca-certificates";

    /// Directory the rebuilt trust store is written to.
    pub const CERTS_DIR: &str = "/etc/ssl/certs";

    /// Combined PEM bundle read by OpenSSL, rustls-native-certs, pip, etc.
    pub const CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

    pub const PASSWD: &str = "/etc/passwd";
    pub const GROUP: &str = "/etc/group";

    /// Root of the home directories created for execution identities.
    pub const HOME_ROOT: &str = "/home";

    pub const ZONEINFO_DIR: &str = "/usr/share/zoneinfo";

    /// Frozen environment snapshot and argv read by `botstrap launch`.
    pub const LAUNCH_SPEC: &str = "/etc/botstrap/launch.json";

    /// Location of the supervised launcher binary.
    pub const LAUNCHER_BINARY: &str = "/usr/local/bin/botstrap";

    /// Directory container runtimes mount file-based secrets into.
    pub const SECRETS_DIR: &str = "/run/secrets";
}

/// Image config labels.
pub mod labels {
    pub const LEDGER: &str = "org.botstrap.ledger";
    pub const SECRETS: &str = "org.botstrap.secrets";
    pub const OVERRIDABLE: &str = "org.botstrap.env.overridable";
    pub const IDENTITY_UID: &str = "org.botstrap.identity.uid";
    pub const DEPENDENCY_DIGEST: &str = "org.botstrap.dependencies.digest";
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
    pub const CREATED: &str = "org.opencontainers.image.created";
}

/// Environment variables.
pub mod env {
    /// Process-local timezone (the TIMEZONE option).
    pub const TIMEZONE: &str = "TZ";

    /// Default name of the platform credential (the AUTH_TOKEN option).
    pub const DEFAULT_AUTH_TOKEN: &str = "TELEGRAM_TOKEN";

    /// Overrides the botstrap home directory.
    pub const BOTSTRAP_HOME: &str = "BOTSTRAP_HOME";

    /// Log filter for botstrap itself; falls back to `RUST_LOG`.
    pub const BOTSTRAP_LOG: &str = "BOTSTRAP_LOG";

    /// Suffix of the variable pointing at a file holding a secret.
    pub const FILE_SUFFIX: &str = "_FILE";
}

/// Execution identity defaults.
pub mod identity {
    pub const DEFAULT_NAME: &str = "botuser";

    /// First id handed out to a non-privileged identity.
    pub const FIRST_UNPRIVILEGED_ID: u32 = 1000;

    /// Upper bound of the search for a free id.
    pub const LAST_UNPRIVILEGED_ID: u32 = 60000;

    pub const DEFAULT_SHELL: &str = "/bin/sh";

    pub const HOME_MODE: u32 = 0o755;
}

/// Layer tarball settings.
pub mod layer {
    pub const GZIP_LEVEL: u32 = 6;
}

/// Files under the botstrap home directory.
pub mod filenames {
    pub const DB: &str = "botstrap.db";
    pub const LOG_PREFIX: &str = "botstrap.log";
}
