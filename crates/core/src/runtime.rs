use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Directories searched for the ONNX Runtime shared library, in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ort` at a bundled ONNX Runtime unless `ORT_DYLIB_PATH` is already set.
///
/// Call at the very start of `main()`, before any session is built.
pub fn setup_runtime_libs() -> Option<PathBuf> {
    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return Some(PathBuf::from(existing));
    }

    let found = find_ort_dylib_in_dirs(&candidate_lib_dirs())?;
    env::set_var(ORT_DYLIB_ENV, &found);
    Some(found)
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!(path = %ort, "ONNX Runtime library"),
        Ok(ort) => warn!(path = %ort, "ORT_DYLIB_PATH is set but the file does not exist"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ONNX Runtime will use the default search path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_directory() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join(ORT_LIB_NAME), b"second").unwrap();

        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );

        std::fs::write(first.join(ORT_LIB_NAME), b"first").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second]),
            Some(first.join(ORT_LIB_NAME))
        );
    }

    #[test]
    fn find_ort_dylib_returns_none_when_absent() {
        let temp = tempfile::tempdir().unwrap();
        assert!(find_ort_dylib_in_dirs(&[temp.path().to_path_buf()]).is_none());
    }
}
