//! Pluggable checker loading: a shared-library artifact plus a fully
//! qualified name resolve to one `check(value) -> line` operation.
//!
//! The artifact must export
//! `extern "C" fn(value: u32, buf: *mut u8, cap: usize) -> i64` under the
//! symbol `<name with "::" replaced by "_">_check`. The function writes one
//! UTF-8 line for `value` into the buffer and returns the written length,
//! or a negative value on failure. The caller owns the buffer, so no
//! allocation crosses the library boundary.

use libloading::{Library, Symbol};

/// One conjecture checker: a value in, one line of text out.
pub trait Checker: Send {
    fn check(&self, value: u32) -> Result<String, CheckerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CheckerError {
    #[error("cannot load checker artifact {path}: {source}")]
    Load {
        path: String,
        source: libloading::Error,
    },
    #[error("checker symbol {symbol} not found: {source}")]
    Resolve {
        symbol: String,
        source: libloading::Error,
    },
    #[error("checker failed on value {value}")]
    Check { value: u32 },
    #[error("checker produced invalid UTF-8 for value {value}")]
    InvalidOutput { value: u32 },
}

type CheckFn = unsafe extern "C" fn(value: u32, buf: *mut u8, cap: usize) -> i64;

/// Checker backed by a dynamically loaded library. The library handle is
/// held for as long as the checker is used; `func` stays valid because
/// `_lib` outlives it.
#[derive(Debug)]
pub struct LoadedChecker {
    _lib: Library,
    func: CheckFn,
}

/// Longest line a checker may produce, in bytes.
const LINE_CAP: usize = 1024;

/// Resolve a checker from an artifact path and a fully qualified name.
/// Absence or load failure fails only the affected job.
pub fn load(locator: &str, name: &str) -> Result<LoadedChecker, CheckerError> {
    let symbol = symbol_name(name);
    let lib = unsafe { Library::new(locator) }.map_err(|source| CheckerError::Load {
        path: locator.to_owned(),
        source,
    })?;
    let func = unsafe {
        let sym: Symbol<CheckFn> =
            lib.get(symbol.as_bytes())
                .map_err(|source| CheckerError::Resolve {
                    symbol: symbol.clone(),
                    source,
                })?;
        *sym
    };
    Ok(LoadedChecker { _lib: lib, func })
}

fn symbol_name(name: &str) -> String {
    format!("{}_check", name.replace("::", "_"))
}

impl Checker for LoadedChecker {
    fn check(&self, value: u32) -> Result<String, CheckerError> {
        let mut buf = vec![0u8; LINE_CAP];
        let n = unsafe { (self.func)(value, buf.as_mut_ptr(), buf.len()) };
        if n < 0 || n as usize > buf.len() {
            return Err(CheckerError::Check { value });
        }
        buf.truncate(n as usize);
        String::from_utf8(buf).map_err(|_| CheckerError::InvalidOutput { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_derived_from_qualified_name() {
        assert_eq!(symbol_name("collatz::Steps"), "collatz_Steps_check");
        assert_eq!(symbol_name("plain"), "plain_check");
    }

    #[test]
    fn missing_artifact_fails_load() {
        let err = load("/no/such/artifact.so", "collatz::Steps").unwrap_err();
        assert!(matches!(err, CheckerError::Load { .. }));
    }
}
