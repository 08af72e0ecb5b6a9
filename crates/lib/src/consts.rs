//! Crate-wide constants.

/// Application name, used for per-user directories and env var prefixes.
pub const APP_NAME: &str = "phpstatic";

/// Upstream repository of the static-php-cli build tool.
pub const DEFAULT_TOOL_REPOSITORY: &str = "https://github.com/crazywhalecc/static-php-cli.git";

/// Directory name of the build tool checkout inside the clone directory.
pub const DEFAULT_TOOL_DIR_NAME: &str = "static-php-cli";

/// Lock file placed in the clone directory while a build runs.
pub const LOCK_FILENAME: &str = ".phpstatic.lock";

/// Suffix of partially downloaded files.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Number of log lines a `BuildJob` keeps for failure reports.
pub const JOB_LOG_TAIL: usize = 200;

/// PHP extensions compiled into every build unless the manifest overrides them.
pub const DEFAULT_BASE_EXTENSIONS: &[&str] = &[
  "bcmath",
  "bz2",
  "ctype",
  "curl",
  "dom",
  "fileinfo",
  "filter",
  "gd",
  "iconv",
  "mbstring",
  "opcache",
  "openssl",
  "pdo",
  "pdo_sqlite",
  "phar",
  "session",
  "simplexml",
  "sockets",
  "sqlite3",
  "tokenizer",
  "xml",
  "zip",
  "zlib",
  "soap",
];

/// Selectable extension groups and the PHP extensions each one enables.
pub const DEFAULT_EXTENSION_SETS: &[(&str, &[&str])] = &[
  ("mysql", &["pdo_mysql", "mysqli", "mysqlnd"]),
  ("sqlsrv", &["sqlsrv", "pdo_sqlsrv"]),
  ("pgsql", &["pgsql", "pdo_pgsql"]),
];
