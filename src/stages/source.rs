//! Source build of Incus: Go toolchain, checkout, `make`, installation.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::SourceSettings;
use crate::error::{InstallError, MutationError};
use crate::fetch::archive::extract_tar_gz;
use crate::fetch::{sha256_file, FetchSpec};
use crate::mutate;
use crate::pipeline::rollback::RollbackAction;
use crate::runner::CommandSpec;
use crate::stage::{FnStage, StageContext};

pub const LD_CONF_PATH: &str = "/etc/ld.so.conf.d/incus.conf";

/// Binary whose RPATH must point at the private library directory.
const DAEMON: &str = "incusd";
const BUILD_TIMEOUT_SECS: u64 = 3600;

fn go_arch(machine: &str) -> Result<&'static str, InstallError> {
    match machine.trim() {
        "x86_64" | "amd64" => Ok("amd64"),
        "aarch64" | "arm64" => Ok("arm64"),
        "ppc64le" => Ok("ppc64le"),
        "s390x" => Ok("s390x"),
        "riscv64" => Ok("riscv64"),
        other => Err(InstallError::Config(format!(
            "no Go toolchain published for architecture '{}'",
            other
        ))),
    }
}

pub fn go_archive_name(version: &str, arch: &str) -> String {
    format!("go{}.linux-{}.tar.gz", version, arch)
}

/// Environment for `make deps` and `make`.
pub fn build_env(ctx: &StageContext<'_>) -> Vec<(String, String)> {
    let source = &ctx.config.source;
    let gopath = ctx.root.resolve(source.gopath()).display().to_string();
    let goroot = ctx.root.resolve(source.go_root()).display().to_string();
    let raft = format!("{}/deps/raft", gopath);
    let cowsql = format!("{}/deps/cowsql", gopath);
    vec![
        ("GOPATH".into(), gopath.clone()),
        ("GOROOT".into(), goroot.clone()),
        (
            "PATH".into(),
            format!(
                "{}/bin:{}/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                goroot, gopath
            ),
        ),
        (
            "CGO_CFLAGS".into(),
            format!("-I{}/include/ -I{}/include/", raft, cowsql),
        ),
        (
            "CGO_LDFLAGS".into(),
            format!("-L{}/.libs -L{}/.libs/", raft, cowsql),
        ),
        (
            "LD_LIBRARY_PATH".into(),
            format!("{}/.libs/:{}/.libs/", raft, cowsql),
        ),
        (
            "CGO_LDFLAGS_ALLOW".into(),
            "(-Wl,-wrap,pthread_create)|(-Wl,-z,now)".into(),
        ),
    ]
}

fn with_env(mut cmd: CommandSpec, env: &[(String, String)]) -> CommandSpec {
    for (key, value) in env {
        cmd = cmd.env(key.as_str(), value.as_str());
    }
    cmd
}

pub fn prepare_build_dir() -> FnStage {
    FnStage::new("prepare-build-dir", "Create the build directory", |ctx| {
        let build_dir = ctx.config.source.build_dir.clone();
        mutate::ensure(ctx.root, &mutate::dir(&build_dir))?;
        ctx.record(RollbackAction::RemoveDir(build_dir));
        Ok(())
    })
    .skip_if(|ctx| Ok(ctx.root.resolve(&ctx.config.source.build_dir).is_dir()))
}

fn go_version_cmd(ctx: &StageContext<'_>) -> CommandSpec {
    let go = ctx.root.resolve(ctx.config.source.go_root().join("bin/go"));
    CommandSpec::new(go.display().to_string())
        .arg("version")
        .expect_stdout(format!("go{} ", ctx.config.source.go_version))
}

pub fn go_toolchain() -> FnStage {
    FnStage::new("go-toolchain", "Install the Go toolchain for the build", |ctx| {
        let source = &ctx.config.source;
        let machine = ctx.run(CommandSpec::new("uname").arg("-m"))?.stdout;
        let archive = go_archive_name(&source.go_version, go_arch(&machine)?);
        let sources = source
            .go_mirrors
            .iter()
            .map(|m| format!("{}/{}", m.trim_end_matches('/'), archive))
            .collect();
        let mut spec = FetchSpec::download(sources, source.downloads_dir().join(&archive))
            .with_retries(ctx.config.fetch.max_retries)
            .with_timeout(ctx.config.fetch.timeout());
        if let Some(sha) = &source.go_sha256 {
            spec = spec.with_sha256(sha.as_str());
        }
        let downloaded = ctx.fetcher().fetch(&spec)?;
        extract_tar_gz(
            &ctx.root.resolve(&downloaded),
            &ctx.root.resolve(source.toolchain_dir()),
        )?;
        Ok(())
    })
    .skip_if(|ctx| Ok(ctx.succeeds(go_version_cmd(ctx))))
    .verify(|ctx| {
        ctx.run(go_version_cmd(ctx)).map(|_| ()).map_err(|e| {
            InstallError::verification("Go toolchain", e.to_string())
                .with_hint(format!("ls {}", ctx.config.source.go_root().join("bin").display()))
        })
    })
}

pub fn fetch_source() -> FnStage {
    FnStage::new("fetch-source", "Clone the Incus source tree", |ctx| {
        let source = &ctx.config.source;
        let spec = FetchSpec::git_clone(
            source.repositories.clone(),
            source.branch.clone(),
            source.checkout_dir(),
        )
        .with_retries(ctx.config.fetch.max_retries)
        .with_timeout(ctx.config.fetch.timeout());
        ctx.fetcher().fetch(&spec)?;
        Ok(())
    })
    .skip_if(|ctx| {
        Ok(ctx
            .root
            .resolve(ctx.config.source.checkout_dir().join(".git"))
            .is_dir())
    })
}

fn built_binaries(ctx: &StageContext<'_>) -> Vec<PathBuf> {
    let bin = ctx.root.resolve(ctx.config.source.gopath().join("bin"));
    ["incus", DAEMON].iter().map(|b| bin.join(b)).collect()
}

pub fn build_source() -> FnStage {
    FnStage::new("build-source", "Build Incus and its bundled libraries", |ctx| {
        let env = build_env(ctx);
        let checkout = ctx.root.resolve(ctx.config.source.checkout_dir());
        let timeout = std::time::Duration::from_secs(BUILD_TIMEOUT_SECS);
        for target in [Some("deps"), None] {
            let mut cmd = CommandSpec::new("make").cwd(&checkout).timeout(timeout);
            if let Some(target) = target {
                cmd = cmd.arg(target);
            }
            ctx.run(with_env(cmd, &env))?;
        }
        Ok(())
    })
    .skip_if(|ctx| Ok(built_binaries(ctx).iter().all(|p| p.is_file())))
    .verify(|ctx| match built_binaries(ctx).into_iter().find(|p| !p.is_file()) {
        None => Ok(()),
        Some(missing) => Err(InstallError::verification(
            missing.display().to_string(),
            "build finished but the binary was not produced",
        )
        .with_hint(format!(
            "make -C {}",
            ctx.config.source.checkout_dir().display()
        ))),
    })
}

/// Regular files in the build output `bin` directory.
fn build_outputs(source: &SourceSettings, ctx: &StageContext<'_>) -> Result<Vec<PathBuf>, InstallError> {
    let bin = ctx.root.resolve(source.gopath().join("bin"));
    let mut outputs = Vec::new();
    for entry in fs::read_dir(&bin).map_err(|e| MutationError::io(&bin, "listing build outputs", e))? {
        let entry = entry.map_err(|e| MutationError::io(&bin, "listing build outputs", e))?;
        if entry.path().is_file() {
            outputs.push(entry.path());
        }
    }
    outputs.sort();
    Ok(outputs)
}

/// Shared objects produced by `make deps` (raft, cowsql).
fn bundled_libraries(source: &SourceSettings, ctx: &StageContext<'_>) -> Vec<PathBuf> {
    let deps = ctx.root.resolve(source.gopath().join("deps"));
    let mut libs: Vec<PathBuf> = WalkDir::new(deps)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.starts_with("lib") && name.contains(".so") && !e.file_type().is_dir()
        })
        .map(|e| e.into_path())
        .collect();
    libs.sort();
    libs
}

/// Copy `src` to `dest` through a temp file so a running binary is replaced
/// rather than overwritten.
fn install_file(src: &Path, dest: &Path) -> Result<(), MutationError> {
    let tmp = dest.with_extension(format!("tmp-{}", std::process::id()));
    fs::copy(src, &tmp).map_err(|e| MutationError::io(dest, "copying", e))?;
    fs::rename(&tmp, dest).map_err(|e| MutationError::io(dest, "renaming into place", e))
}

fn same_content(a: &Path, b: &Path) -> bool {
    match (sha256_file(a), sha256_file(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn binaries_installed(ctx: &StageContext<'_>) -> Result<bool, InstallError> {
    let source = &ctx.config.source;
    let bin_dir = ctx.root.resolve(source.bin_dir());
    let outputs = build_outputs(source, ctx)?;
    Ok(!outputs.is_empty()
        && outputs.iter().all(|out| match out.file_name() {
            Some(name) => same_content(out, &bin_dir.join(name)),
            None => false,
        }))
}

pub fn install_binaries() -> FnStage {
    FnStage::new(
        "install-binaries",
        "Install binaries and bundled libraries",
        |ctx| {
            let source = &ctx.config.source;
            let lib_dir = source.lib_dir();
            mutate::ensure_all(
                ctx.root,
                &[mutate::dir(source.bin_dir()), mutate::dir(&lib_dir)],
            )?;

            let libs_full = ctx.root.resolve(&lib_dir);
            for lib in bundled_libraries(source, ctx) {
                if let Some(name) = lib.file_name() {
                    install_file(&lib, &libs_full.join(name))?;
                }
            }

            let daemon = ctx.root.resolve(source.gopath().join("bin").join(DAEMON));
            ctx.run(
                CommandSpec::new("patchelf")
                    .arg("--set-rpath")
                    .arg(lib_dir.display().to_string())
                    .arg(daemon.display().to_string()),
            )?;

            let bin_full = ctx.root.resolve(source.bin_dir());
            for output in build_outputs(source, ctx)? {
                if let Some(name) = output.file_name() {
                    install_file(&output, &bin_full.join(name))?;
                    println!("  Installed {}", source.bin_dir().join(name).display());
                }
            }
            Ok(())
        },
    )
    .skip_if(binaries_installed)
    .verify(|ctx| {
        let source = &ctx.config.source;
        let daemon = ctx.root.resolve(source.bin_dir().join(DAEMON));
        let lib_dir = source.lib_dir().display().to_string();
        ctx.run(
            CommandSpec::new("patchelf")
                .arg("--print-rpath")
                .arg(daemon.display().to_string())
                .expect_stdout(lib_dir.as_str()),
        )
        .map(|_| ())
        .map_err(|_| {
            InstallError::verification(
                source.bin_dir().join(DAEMON).display().to_string(),
                format!("RPATH does not include {}", lib_dir),
            )
            .with_hint(format!(
                "patchelf --print-rpath {}",
                source.bin_dir().join(DAEMON).display()
            ))
        })
    })
}

fn ld_conf(source: &SourceSettings) -> mutate::Mutation {
    mutate::file_mode(LD_CONF_PATH, format!("{}\n", source.lib_dir().display()), 0o644)
}

pub fn register_library_path() -> FnStage {
    FnStage::new(
        "register-library-path",
        "Register the Incus library directory with the dynamic linker",
        |ctx| {
            mutate::ensure(ctx.root, &mutate::dir("/etc/ld.so.conf.d"))?;
            mutate::ensure(ctx.root, &ld_conf(&ctx.config.source))?;
            ctx.run(CommandSpec::new("ldconfig"))?;
            Ok(())
        },
    )
    .skip_if(|ctx| Ok(mutate::is_satisfied(ctx.root, &ld_conf(&ctx.config.source))?))
    .verify(|ctx| {
        ctx.run(CommandSpec::new("ldconfig").arg("-p").expect_stdout("libcowsql"))
            .map(|_| ())
            .map_err(|_| {
                InstallError::verification("libcowsql", "not resolvable by the dynamic linker")
                    .with_hint("ldconfig -p | grep -E 'cowsql|raft'")
            })
    })
}

/// Remove the build tree once the install has been verified.
pub fn cleanup_build() -> FnStage {
    FnStage::new("cleanup-build", "Remove build artifacts", |ctx| {
        mutate::ensure(ctx.root, &mutate::absent(&ctx.config.source.build_dir))?;
        Ok(())
    })
    .warning()
    .skip_if(|ctx| Ok(!ctx.root.resolve(&ctx.config.source.build_dir).exists()))
}
