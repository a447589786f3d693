//! Top-level install run: preflight, configuration, pipeline, run record.

use crate::config::prompt::Prompter;
use crate::config::{ConfigDraft, InstallationConfig};
use crate::error::InstallError;
use crate::host::HostRoot;
use crate::pipeline::report::{self, RunManifest, KEEP_RUNS};
use crate::pipeline::rollback::JournalRollback;
use crate::pipeline::PipelineResult;
use crate::preflight;
use crate::preseed::storage::{existing_pool_source, prepare_storage_dir};
use crate::preseed::POOL_NAME;
use crate::runner::CommandRunner;
use crate::stages;

/// Outcome of a run that reached the pipeline.
#[derive(Debug)]
pub struct InstallReport {
    pub run_id: String,
    pub config: InstallationConfig,
    pub result: PipelineResult,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

pub struct Installer<'a> {
    runner: &'a dyn CommandRunner,
    root: HostRoot,
    require_root: bool,
    assume_yes: bool,
    record_runs: bool,
}

impl<'a> Installer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, root: HostRoot) -> Self {
        Self {
            runner,
            root,
            require_root: true,
            assume_yes: false,
            record_runs: true,
        }
    }

    /// Skip the effective-uid check. Only for runners that do not act on
    /// the real host.
    pub fn require_root(mut self, require: bool) -> Self {
        self.require_root = require;
        self
    }

    /// Answer every prompt with its default and proceed without asking.
    pub fn assume_yes(mut self, yes: bool) -> Self {
        self.assume_yes = yes;
        self
    }

    pub fn record_runs(mut self, record: bool) -> Self {
        self.record_runs = record;
        self
    }

    /// Run one installation.
    ///
    /// Errors before the pipeline starts (privilege, tools, configuration,
    /// operator abort) come back as `Err` and leave the host untouched. Once
    /// the pipeline has run the report is returned whether it succeeded or
    /// not.
    pub fn run(
        &self,
        mut draft: ConfigDraft,
        prompter: &mut dyn Prompter,
    ) -> Result<InstallReport, InstallError> {
        if self.require_root {
            preflight::check_privilege()?;
        }
        let family = draft.validate()?;
        preflight::check_host_tools(self.runner, family, draft.method)?;

        if !self.assume_yes {
            draft.prompt(prompter)?;
        }
        draft.validate()?;

        let storage_path = if !draft.run_init {
            draft.storage_path.clone()
        } else if let Some(existing) = existing_pool_source(self.runner) {
            println!(
                "[install] storage pool '{}' already exists at {}; keeping it",
                POOL_NAME,
                existing.display()
            );
            existing
        } else {
            prepare_storage_dir(&self.root, &draft.storage_path)?
        };
        let config = draft.finish(storage_path)?;
        tracing::info!(
            method = config.method.as_str(),
            family = config.os_family.as_str(),
            storage = %config.storage_path.display(),
            "configuration resolved"
        );

        let pipeline = stages::build_plan(&config);
        let run_id = report::generate_run_id();
        let runs_dir = report::runs_dir(&self.root.resolve(&config.state_dir));
        let mut manifest =
            RunManifest::started(&run_id, config.method.as_str(), config.os_family.as_str());
        if self.record_runs {
            if let Err(err) = report::write_manifest(&runs_dir, &manifest) {
                tracing::warn!(error = %format!("{err:#}"), "failed to record run start");
            }
        }

        println!(
            "[install] run {} ({} stages, {} method)",
            run_id,
            pipeline.len(),
            config.method.as_str()
        );
        let result = pipeline.run(&config, self.runner, &self.root, &JournalRollback);

        if self.record_runs {
            manifest.finish(&result);
            if let Err(err) = report::write_manifest(&runs_dir, &manifest) {
                eprintln!("[install] warning: failed to persist run manifest: {err:#}");
            } else if result.is_success() {
                if let Err(err) = report::prune_old_runs(&runs_dir, KEEP_RUNS) {
                    tracing::warn!(error = %format!("{err:#}"), "failed to prune old runs");
                }
            }
        }

        Ok(InstallReport {
            run_id,
            config,
            result,
        })
    }
}

/// What to do next, printed after a successful run.
pub fn usage_summary(config: &InstallationConfig) -> String {
    let mut out = String::new();
    out.push_str("Incus is installed and running.\n\n");
    if config.run_init {
        out.push_str(&format!(
            "  Storage pool 'default' (dir) at {}\n  Network bridge {}\n\n",
            config.storage_path.display(),
            config.bridge_name
        ));
    } else {
        out.push_str("  Initial configuration was skipped; run `incus admin init` to set up\n  storage and networking.\n\n");
    }
    out.push_str("Getting started:\n");
    for (cmd, what) in [
        ("incus version", "client and server versions"),
        ("incus launch images:debian/12 c1", "create and start a container"),
        ("incus list", "list instances"),
        ("incus exec c1 -- bash", "open a shell in an instance"),
        ("incus storage list", "storage pools"),
        ("incus network list", "networks"),
    ] {
        out.push_str(&format!("  {:<36} {}\n", cmd, what));
    }
    out.push_str(&format!(
        "\nTo use incus without root, add your user to the {} group\n(usermod -aG {} <user>) and log in again.\n",
        stages::host::ADMIN_GROUP,
        stages::host::ADMIN_GROUP
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::prompt::ScriptedPrompter;
    use crate::config::{InstallMethod, Overrides};
    use crate::host::OsRelease;
    use crate::pipeline::StageStatus;
    use crate::preseed::PreseedDocument;
    use crate::runner::mock::MockRunner;
    use crate::runner::{CommandOutput, CommandSpec};
    use std::cell::RefCell;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;
    use tempfile::TempDir;

    const POOL: &str = "/var/lib/incus/storage-pools/default";

    fn temp_host(os_release: &str) -> (TempDir, HostRoot) {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/os-release"), os_release).unwrap();
        let root = HostRoot::new(temp.path());
        (temp, root)
    }

    fn draft_for(root: &HostRoot) -> ConfigDraft {
        let release = OsRelease::read(root).unwrap();
        ConfigDraft::new(Some(&release))
    }

    fn write_download(content: &'static str) -> impl Fn(&CommandSpec) -> CommandOutput {
        move |spec| {
            let pos = spec.args.iter().position(|a| a == "-o").unwrap();
            fs::write(&spec.args[pos + 1], content).unwrap();
            CommandOutput::success("")
        }
    }

    /// Mock of a Debian host where Incus is not yet initialised. The returned
    /// cell holds the pool source once `incus admin init` ran.
    fn debian_package_host(runner: &MockRunner) -> Rc<RefCell<Option<String>>> {
        let pool_source = Rc::new(RefCell::new(None::<String>));
        runner.on("curl", write_download("-----BEGIN PGP PUBLIC KEY BLOCK-----\n"));
        runner.reply("dpkg --print-architecture", "amd64\n");
        runner.reply("systemctl is-active", "active\n");
        runner.reply("incus version", "Client version: 6.0.3\nServer version: 6.0.3\n");
        for prefix in ["incus storage show", "incus network show"] {
            let state = pool_source.clone();
            runner.on(prefix, move |_| match state.borrow().as_ref() {
                Some(_) => CommandOutput::success("name: default\n"),
                None => CommandOutput::exit(1, "Error: not found"),
            });
        }
        let state = pool_source.clone();
        runner.on("incus storage get default source", move |_| {
            match state.borrow().as_ref() {
                Some(source) => CommandOutput::success(format!("{}\n", source)),
                None => CommandOutput::exit(1, "Error: Storage pool not found"),
            }
        });
        let state = pool_source.clone();
        runner.on("incus admin init", move |spec| {
            let doc: PreseedDocument =
                serde_yaml::from_str(spec.stdin.as_deref().unwrap_or_default()).unwrap();
            *state.borrow_mut() = doc.storage_source().map(String::from);
            CommandOutput::success("")
        });
        pool_source
    }

    fn preseed_sent(runner: &MockRunner) -> PreseedDocument {
        let init = runner
            .specs()
            .into_iter()
            .find(|s| s.command_line() == "incus admin init --preseed")
            .unwrap();
        serde_yaml::from_str(init.stdin.as_deref().unwrap()).unwrap()
    }

    fn installer<'a>(runner: &'a MockRunner, root: &HostRoot) -> Installer<'a> {
        Installer::new(runner, root.clone()).require_root(false)
    }

    #[test]
    fn test_default_storage_on_empty_target() {
        let (_temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        let runner = MockRunner::new();
        let pool_source = debian_package_host(&runner);
        let mut prompter = ScriptedPrompter::new(["y", "y", ""]);

        let report = installer(&runner, &root)
            .run(draft_for(&root), &mut prompter)
            .unwrap();

        assert!(report.is_success(), "{:?}", report.result.failure);
        assert_eq!(pool_source.borrow().as_deref(), Some(POOL));
        let doc = preseed_sent(&runner);
        assert_eq!(doc.storage_pools[0].config["source"], POOL);
        assert_eq!(doc.networks[0].name, "incusbr0");
        assert!(root.resolve(POOL).is_dir());
        assert!(root
            .resolve("/etc/apt/sources.list.d/zabbly-incus-stable.sources")
            .is_file());

        let runs = report::list_runs(&report::runs_dir(&root.resolve(&report.config.state_dir)))
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");
        assert!(usage_summary(&report.config).contains(POOL));
    }

    #[test]
    fn test_non_empty_storage_uses_subdirectory() {
        let (_temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        fs::create_dir_all(root.resolve(POOL)).unwrap();
        fs::write(root.resolve(POOL).join("leftover.img"), "data").unwrap();
        let runner = MockRunner::new();
        debian_package_host(&runner);
        let mut prompter = ScriptedPrompter::new(["y", "y", ""]);

        let report = installer(&runner, &root)
            .run(draft_for(&root), &mut prompter)
            .unwrap();

        let expected = PathBuf::from(POOL).join("incus");
        assert!(report.is_success());
        assert_eq!(report.config.storage_path, expected);
        assert!(root.resolve(&expected).is_dir());
        assert_eq!(
            preseed_sent(&runner).storage_pools[0].config["source"],
            expected.display().to_string()
        );
    }

    fn tree_snapshot(path: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn test_declined_proceed_changes_nothing() {
        let (temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        let before = tree_snapshot(temp.path());
        let runner = MockRunner::new();
        let mut prompter = ScriptedPrompter::new(["n"]);

        let err = installer(&runner, &root)
            .run(draft_for(&root), &mut prompter)
            .unwrap_err();

        assert!(err.is_user_abort());
        assert!(runner.calls().is_empty());
        assert_eq!(tree_snapshot(temp.path()), before);
    }

    #[test]
    fn test_missing_tools_stop_before_prompts() {
        let (_temp, root) = temp_host("ID=rocky\nID_LIKE=\"rhel centos fedora\"\n");
        let runner = MockRunner::new();
        runner.missing_tool("dnf");
        let mut prompter = ScriptedPrompter::new(["y"]);

        let err = installer(&runner, &root)
            .run(draft_for(&root), &mut prompter)
            .unwrap_err();

        assert_eq!(err.kind(), "tool-missing");
        assert!(prompter.asked().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_assume_yes_skips_prompts() {
        let (_temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        let runner = MockRunner::new();
        debian_package_host(&runner);
        let mut prompter = ScriptedPrompter::new(Vec::<String>::new());

        let report = installer(&runner, &root)
            .assume_yes(true)
            .record_runs(false)
            .run(draft_for(&root), &mut prompter)
            .unwrap();

        assert!(report.is_success());
        assert!(prompter.asked().is_empty());
        assert!(!root.resolve("/var/lib/incus-installer").exists());
    }

    /// Source install where everything up to the build is already in place.
    fn prebuilt_source_host(root: &HostRoot) -> (ConfigDraft, MockRunner) {
        let mut draft = draft_for(root);
        draft.apply_overrides(&Overrides {
            method: Some(InstallMethod::Source),
            run_init: Some(true),
            ..Overrides::default()
        });
        let source = &draft.source;

        let gobin = root.resolve(source.gopath().join("bin"));
        fs::create_dir_all(&gobin).unwrap();
        fs::write(gobin.join("incusd"), "daemon").unwrap();
        fs::write(gobin.join("incus"), "client").unwrap();
        let libs = root.resolve(source.gopath().join("deps/cowsql/.libs"));
        fs::create_dir_all(&libs).unwrap();
        fs::write(libs.join("libcowsql.so.0"), "lib").unwrap();
        fs::create_dir_all(root.resolve(source.checkout_dir().join(".git"))).unwrap();

        let runner = MockRunner::new();
        let go = root.resolve(source.go_root().join("bin/go"));
        runner.reply(&go.display().to_string(), "go version go1.23.4 linux/amd64\n");
        runner.reply("patchelf --print-rpath", "/usr/local/lib/incus\n");
        runner.reply(
            "ldconfig -p",
            "libcowsql.so.0 (libc6,x86-64) => /usr/local/lib/incus/libcowsql.so.0\n",
        );
        runner.fail("systemctl is-enabled");
        runner.fail("systemctl is-active");
        (draft, runner)
    }

    fn assert_service_undone_install_kept(root: &HostRoot, runner: &MockRunner, build_dir: &Path) {
        assert_eq!(runner.count_matching("systemctl stop incus"), 1);
        assert_eq!(runner.count_matching("systemctl disable incus"), 1);
        assert!(!root.resolve("/etc/systemd/system/incus.service").exists());
        assert_eq!(runner.count_matching("incus admin init"), 0);

        assert!(root.resolve("/usr/local/bin/incusd").is_file());
        assert!(root.resolve("/usr/local/bin/incus").is_file());
        assert!(root.resolve("/usr/local/lib/incus/libcowsql.so.0").is_file());
        assert!(root.resolve(build_dir).is_dir());
    }

    #[test]
    fn test_failed_activation_rolls_back_service_only() {
        let (_temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        let (draft, runner) = prebuilt_source_host(&root);
        let build_dir = draft.source.build_dir.clone();
        let mut prompter = ScriptedPrompter::new(["y"]);

        let report = installer(&runner, &root)
            .run(draft, &mut prompter)
            .unwrap();

        let failure = report.result.failure.as_ref().unwrap();
        assert_eq!(failure.stage, "activate-service");
        assert_eq!(failure.error.kind(), "verification");
        assert_eq!(report.result.status_of("install-binaries"), Some(StageStatus::Succeeded));
        assert_eq!(report.result.status_of("initialize"), Some(StageStatus::Pending));
        assert_eq!(report.result.status_of("verify"), Some(StageStatus::Pending));
        assert_service_undone_install_kept(&root, &runner, &build_dir);

        let runs = report::list_runs(&report::runs_dir(&root.resolve(&report.config.state_dir)))
            .unwrap();
        assert_eq!(runs[0].status, "failed");
    }

    #[test]
    fn test_failed_start_still_stops_and_disables() {
        let (_temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        let (draft, runner) = prebuilt_source_host(&root);
        let build_dir = draft.source.build_dir.clone();
        runner.fail("systemctl start");
        let mut prompter = ScriptedPrompter::new(["y"]);

        let report = installer(&runner, &root)
            .run(draft, &mut prompter)
            .unwrap();

        let failure = report.result.failure.as_ref().unwrap();
        assert_eq!(failure.stage, "activate-service");
        assert_eq!(failure.error.kind(), "command");
        assert!(report.result.rollback.iter().all(|step| step.ok));
        assert_service_undone_install_kept(&root, &runner, &build_dir);
    }

    #[test]
    fn test_rerun_after_init_keeps_pool_path() {
        let (_temp, root) = temp_host("ID=debian\nVERSION_CODENAME=bookworm\n");
        let runner = MockRunner::new();
        debian_package_host(&runner);

        let first = installer(&runner, &root)
            .run(draft_for(&root), &mut ScriptedPrompter::new(["y", "y", ""]))
            .unwrap();
        assert!(first.is_success());

        // the daemon has populated the pool since
        fs::create_dir_all(root.resolve(POOL).join("containers")).unwrap();

        let second = installer(&runner, &root)
            .run(draft_for(&root), &mut ScriptedPrompter::new(["y", "y", ""]))
            .unwrap();

        assert!(second.is_success(), "{:?}", second.result.failure);
        assert_eq!(second.config.storage_path, first.config.storage_path);
        assert_eq!(second.config.storage_path, PathBuf::from(POOL));
        assert!(!root.resolve(POOL).join("incus").exists());
        assert_eq!(runner.count_matching("incus admin init"), 1);
        assert_eq!(second.result.status_of("initialize"), Some(StageStatus::Skipped));
        assert_eq!(second.result.status_of("install-incus"), Some(StageStatus::Skipped));
        assert_eq!(second.result.status_of("host-config"), Some(StageStatus::Skipped));
        assert!(usage_summary(&second.config).contains(&format!("at {}\n", POOL)));
    }

    #[test]
    fn test_privilege_check_is_on_by_default() {
        let runner = MockRunner::new();
        let installer = Installer::new(&runner, HostRoot::new("/srv/scratch"));
        assert!(installer.require_root);
        assert!(!installer.require_root(false).require_root);
    }

    #[test]
    fn test_usage_summary_without_init() {
        let mut config = InstallationConfig::defaults(crate::host::OsFamily::Debian);
        config.run_init = false;
        let summary = usage_summary(&config);
        assert!(summary.contains("incus admin init"));
        assert!(summary.contains("incus-admin"));
    }
}
