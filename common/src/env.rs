//! Environment-variable-driven configuration helpers.
//!
//! The broker is configured primarily through environment variables (see
//! each service's `Config::from_env`), optionally seeded from a `.env` file
//! for local development.

use std::env::VarError;
use std::str::FromStr;

/// Load key=value pairs from a `.env` file at `path` (or `.env` in the
/// current directory when `path` is `None`) into the process environment,
/// without overwriting variables that are already set.
///
/// # Safety
///
/// Mutates the process environment via [`std::env::set_var`], which is only
/// sound when no other thread is concurrently reading or writing the
/// environment. Callers must invoke this before spawning any threads
/// (including the tokio runtime).
pub unsafe fn load_dotenv(path: Option<&str>) -> anyhow::Result<()> {
    let iter = match path {
        Some(path) => dotenvy::from_path_iter(path),
        None => dotenvy::dotenv_iter(),
    };
    let iter = match iter {
        Ok(iter) => iter,
        // Missing `.env` file is fine; env vars may be set some other way.
        Err(e) if e.not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for item in iter {
        let (key, value) = item?;
        if std::env::var_os(&key).is_none() {
            // SAFETY: forwarded from the caller's safety obligation.
            unsafe { std::env::set_var(key, value) };
        }
    }

    Ok(())
}

/// Read an environment variable, returning `Ok(None)` if it's simply unset
/// (as opposed to set but not valid unicode, which is an error).
pub fn var_opt(key: &str) -> anyhow::Result<Option<String>> {
    match std::env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(e @ VarError::NotUnicode(_)) => {
            Err(anyhow::anyhow!("env var `{key}` is not valid unicode: {e}"))
        }
    }
}

/// Read and parse an environment variable, falling back to `default` if
/// unset. Errors if the variable is set but fails to parse.
pub fn var_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var_opt(key)? {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("env var `{key}` = `{value}` is invalid: {e}")),
        None => Ok(default),
    }
}

/// Read and parse a required environment variable.
pub fn require_var<T>(key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = var_opt(key)?.ok_or_else(|| anyhow::anyhow!("missing required env var `{key}`"))?;
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("env var `{key}` = `{value}` is invalid: {e}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn var_or_falls_back() {
        let val: u16 = var_or("BROKER_TEST_DOES_NOT_EXIST_XYZ", 42).unwrap();
        assert_eq!(val, 42);
    }
}
