#![allow(clippy::expect_used, clippy::unwrap_used)]

//! End-to-end checks of the properties the compilers guarantee together:
//! normalization never widens scope, denied paths carry full ancestor
//! towers, and the dangerous-file scan grows monotonically with depth.

use std::path::Path;
use std::path::PathBuf;
use vsbx_core::config::FilesystemConfig;
use vsbx_core::config::PolicyConfig;
use vsbx_core::mandatory_deny::scan_dangerous_paths;
use vsbx_core::paths::normalize_path_pattern;
use vsbx_core::paths::within_boundary;
use vsbx_core::seatbelt::SeatbeltParams;
use vsbx_core::seatbelt::build_profile;

fn deny_read_profile(denied: &str) -> String {
    let config = PolicyConfig {
        filesystem: Some(FilesystemConfig {
            deny_read: vec![denied.to_string()],
            ..Default::default()
        }),
        ..Default::default()
    };
    build_profile(&SeatbeltParams {
        command: "true",
        shell: "/bin/bash",
        config: &config,
        cwd: Path::new("/work"),
        http_proxy_port: None,
        socks_proxy_port: None,
        session_suffix: "cafef00d",
    })
}

#[test]
fn every_denied_path_carries_a_full_ancestor_tower() {
    let profile = deny_read_profile("/a/b/c/d");
    for path in ["/a/b/c/d", "/a/b/c", "/a/b", "/a"] {
        let rule = format!("(deny file-write-unlink (literal \"{path}\")");
        assert!(profile.contains(&rule), "missing tower rule for {path}");
    }
    assert!(!profile.contains("(deny file-write-unlink (literal \"/\")"));
}

#[test]
fn normalization_never_widens_the_restriction_surface() {
    let cwd = std::env::current_dir().expect("cwd");
    for pattern in [
        "/tmp/vsbx-case",
        "/var/log/nothing-here",
        "relative/path",
        "~/somewhere",
        "/usr",
        "/",
    ] {
        let normalized = PathBuf::from(normalize_path_pattern(pattern, &cwd));
        // Recompute what the original absolute path was and check the
        // boundary invariant against the normalized result.
        let expanded = vsbx_core::paths::expand_tilde(pattern);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };
        assert!(
            normalized == absolute || within_boundary(&absolute, &normalized),
            "{pattern}: {} escaped the boundary of {}",
            normalized.display(),
            absolute.display()
        );
    }
}

#[tokio::test]
async fn scan_results_grow_monotonically_with_depth() {
    if which::which("rg").is_err() {
        return;
    }
    let tmp = tempfile::tempdir().expect("tempdir");
    let cwd = tmp.path().canonicalize().expect("canonical tempdir");
    std::fs::write(cwd.join(".gitconfig"), "[user]").expect("depth-1 file");
    std::fs::create_dir_all(cwd.join("a")).expect("depth-2 dir");
    std::fs::write(cwd.join("a/.gitconfig"), "[user]").expect("depth-2 file");
    std::fs::create_dir_all(cwd.join("a/b/c")).expect("depth-4 dirs");
    std::fs::write(cwd.join("a/b/c/.gitconfig"), "[user]").expect("depth-4 file");

    let shallow = scan_dangerous_paths(&cwd, 1, None, false, None).await;
    let medium = scan_dangerous_paths(&cwd, 3, None, false, None).await;
    let deep = scan_dangerous_paths(&cwd, 10, None, false, None).await;

    let as_set = |paths: &[PathBuf]| paths.iter().cloned().collect::<std::collections::BTreeSet<_>>();
    let (shallow, medium, deep) = (as_set(&shallow), as_set(&medium), as_set(&deep));

    assert!(shallow.is_subset(&medium), "depth 1 ⊄ depth 3");
    assert!(medium.is_subset(&deep), "depth 3 ⊄ depth 10");
    assert!(shallow.contains(&cwd.join(".gitconfig")));
    assert!(medium.contains(&cwd.join("a/.gitconfig")));
    assert!(deep.contains(&cwd.join("a/b/c/.gitconfig")));
    assert!(!medium.contains(&cwd.join("a/b/c/.gitconfig")));
}
