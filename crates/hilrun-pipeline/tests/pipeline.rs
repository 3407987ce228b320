//! End-to-end pipeline runs driven by `sh` standing in for the toolchain,
//! flash tool, and emulator.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hilrun_pipeline::{
    LogSource, Pipeline, PipelineConfig, PipelineError, RunReport, Stage, Verdict,
};
use hilrun_profiles::{
    ArtifactFormat, CompileStyle, DeployMode, LinkerSpec, PlatformProfile, Registry,
};
use tokio_util::sync::CancellationToken;

const BUILD_OK: &str = "echo compiling; printf firmware > {output}";

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.c"), "int main(void) { return 0; }\n").unwrap();
        Self { dir }
    }

    fn source(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn build_root(&self) -> PathBuf {
        self.dir.path().join("build")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn pipeline(&self, profiles: Vec<PlatformProfile>) -> Arc<Pipeline> {
        self.pipeline_with(profiles, true)
    }

    fn pipeline_with(&self, profiles: Vec<PlatformProfile>, keep: bool) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(Registry::with_profiles(profiles)),
            PipelineConfig {
                build_root: self.build_root(),
                keep_build_dirs: keep,
            },
        ))
    }
}

fn profile(id: &str, build: &str, emulator: &str) -> PlatformProfile {
    let mut p = PlatformProfile::stm32_qemu();
    p.id = id.into();
    p.compiler.program = "sh".into();
    p.compiler.style = CompileStyle::Sdk;
    p.compiler.flags = vec!["-c".into(), build.into()];
    p.linker = LinkerSpec::default();
    p.artifact.path = "fw.bin".into();
    p.artifact.format = ArtifactFormat::Bin;
    p.deploy.program = "sh".into();
    p.deploy.args = vec!["-c".into(), emulator.into()];
    p.deploy.startup_grace_ms = 5_000;
    p.timeout_secs = 10;
    p.success_keywords = vec!["PASS".into()];
    p.failure_keywords = vec!["FAIL".into()];
    p
}

async fn run(fx: &Fixture, p: PlatformProfile) -> RunReport {
    let id = p.id.clone();
    fx.pipeline(vec![p])
        .run(&id, &fx.source(), CancellationToken::new())
        .await
        .unwrap()
}

fn console(report: &RunReport) -> Vec<&str> {
    report.lines_from(LogSource::Console).collect()
}

#[tokio::test]
async fn passing_run_reports_every_stage() {
    let fx = Fixture::new();
    let report = run(
        &fx,
        profile("board", BUILD_OK, "echo booting; echo 'ALL TESTS PASS'; exec sleep 30"),
    )
    .await;

    assert_eq!(report.verdict, Verdict::Pass, "{report}");
    assert_eq!(console(&report), vec!["booting", "ALL TESTS PASS"]);
    assert!(report.reason.contains("'PASS'"));
    for stage in [Stage::Compile, Stage::Deploy, Stage::Monitor, Stage::Teardown] {
        assert!(report.timing(stage).is_some(), "missing {stage}");
    }
    let artifact = report.artifact.as_ref().unwrap();
    assert_eq!(artifact.size_bytes, 8);
    assert!(artifact.path.starts_with(fx.build_root().join("board")));
    assert!(report.lines_from(LogSource::Compiler).any(|l| l == "compiling"));
}

#[tokio::test]
async fn compile_failure_never_deploys() {
    let fx = Fixture::new();
    let marker = fx.path("deployed");
    let report = run(
        &fx,
        profile(
            "board",
            "echo 'main.c:3: error: expected declaration' >&2; exit 1",
            &format!("touch {}; echo PASS", marker.display()),
        ),
    )
    .await;

    assert_eq!(report.verdict, Verdict::ToolchainError);
    assert!(!marker.exists());
    assert!(report.timing(Stage::Deploy).is_none());
    assert!(report.artifact.is_none());
    assert!(report
        .lines_from(LogSource::Compiler)
        .any(|l| l.contains("expected declaration")));
}

#[tokio::test]
async fn silent_compiler_without_artifact_is_toolchain_error() {
    let fx = Fixture::new();
    let marker = fx.path("deployed");
    let report = run(
        &fx,
        profile("board", "true", &format!("touch {}", marker.display())),
    )
    .await;
    assert_eq!(report.verdict, Verdict::ToolchainError);
    assert!(report.reason.contains("no artifact"), "{}", report.reason);
    assert!(!marker.exists());
}

#[tokio::test]
async fn failure_keyword_wins() {
    let fx = Fixture::new();
    let report = run(
        &fx,
        profile(
            "board",
            BUILD_OK,
            "echo 'test_uart ... FAIL'; echo 'ALL TESTS PASS'; exec sleep 30",
        ),
    )
    .await;
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(console(&report), vec!["test_uart ... FAIL"]);
}

#[tokio::test]
async fn silence_times_out_with_partial_log() {
    let fx = Fixture::new();
    let mut p = profile("board", BUILD_OK, "echo alive; exec sleep 30");
    p.timeout_secs = 1;
    let started = std::time::Instant::now();
    let report = run(&fx, p).await;
    assert_eq!(report.verdict, Verdict::Timeout);
    assert_eq!(console(&report), vec!["alive"]);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn emulator_exit_is_stream_closed() {
    let fx = Fixture::new();
    let report = run(&fx, profile("board", BUILD_OK, "echo booting; echo halted")).await;
    assert_eq!(report.verdict, Verdict::StreamClosed);
    assert_eq!(console(&report), vec!["booting", "halted"]);
    assert!(report.reason.contains("console closed"));
}

#[tokio::test]
async fn end_marker_is_a_failure() {
    let fx = Fixture::new();
    let mut p = profile("board", BUILD_OK, "echo '=== END ==='; exec sleep 30");
    p.end_marker = Some("=== END ===".into());
    let report = run(&fx, p).await;
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.reason.contains("end marker"));
}

#[tokio::test]
async fn missing_emulator_is_deploy_error() {
    let fx = Fixture::new();
    let mut p = profile("board", BUILD_OK, "");
    p.deploy.program = "/nonexistent/qemu-system-arm".into();
    let report = run(&fx, p).await;
    assert_eq!(report.verdict, Verdict::DeployError);
    assert!(report.reason.contains("not installed"));
    assert!(report.artifact.is_some());
}

#[tokio::test]
async fn hardware_run_reads_serial_device() {
    if hilrun_pipeline::SERIAL_AVAILABLE {
        // a regular file is not a tty
        return;
    }
    let fx = Fixture::new();
    let device = fx.path("ttyUSB0");
    std::fs::write(&device, "AVR Ready\nself-test PASS\n").unwrap();

    let mut p = profile("bench", BUILD_OK, "echo 'wrote 8 bytes to {serial_port} at {baud}'");
    p.deploy.mode = DeployMode::Hardware;
    p.serial.device = device.display().to_string();
    p.serial.baud = 9600;
    let report = run(&fx, p).await;

    assert_eq!(report.verdict, Verdict::Pass, "{report}");
    let flash: Vec<_> = report.lines_from(LogSource::Deploy).collect();
    assert_eq!(
        flash,
        vec![format!("wrote 8 bytes to {} at 9600", device.display())]
    );
}

#[tokio::test]
async fn unknown_platform_never_starts() {
    let fx = Fixture::new();
    let err = fx
        .pipeline(vec![])
        .start("nope", fx.source())
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownPlatform { .. }));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancel_kills_emulator() {
    let fx = Fixture::new();
    let p = profile("board", BUILD_OK, "echo \"pid $$\"; exec sleep 30");
    let handle = fx.pipeline(vec![p]).start("board", fx.source()).unwrap();

    let mut progress = handle.progress();
    let line = tokio::time::timeout(
        Duration::from_secs(10),
        progress.wait_for(|p| p.console_lines >= 1),
    )
    .await
    .unwrap()
    .unwrap()
    .last_line
    .clone()
    .unwrap();
    let pid: u32 = line.trim_start_matches("pid ").parse().unwrap();
    assert!(std::path::Path::new(&format!("/proc/{pid}")).exists());

    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.verdict, Verdict::Cancelled);
    assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancel_during_emulator_startup() {
    let fx = Fixture::new();
    let pid_file = fx.path("emulator.pid");
    let mut p = profile(
        "board",
        BUILD_OK,
        &format!("echo $$ > {}; exec sleep 30", pid_file.display()),
    );
    p.deploy.startup_grace_ms = 30_000;
    let handle = fx.pipeline(vec![p]).start("board", fx.source()).unwrap();

    let mut progress = handle.progress();
    tokio::time::timeout(
        Duration::from_secs(10),
        progress.wait_for(|p| p.stage == Stage::Deploy),
    )
    .await
    .unwrap()
    .unwrap();
    let pid: u32 = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.verdict, Verdict::Cancelled);
    assert!(report.reason.contains("deploy"));
    assert!(report.timing(Stage::Monitor).is_none());
    assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
}

#[tokio::test]
async fn cancel_during_compile() {
    let fx = Fixture::new();
    let p = profile("board", "exec sleep 30", "echo PASS");
    let handle = fx.pipeline(vec![p]).start("board", fx.source()).unwrap();
    let mut progress = handle.progress();
    progress
        .wait_for(|p| p.stage == Stage::Compile)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.verdict, Verdict::Cancelled);
    assert!(report.timing(Stage::Deploy).is_none());
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(vec![
        profile("board-a", BUILD_OK, "echo 'I am a'; sleep 0.2; echo PASS; exec sleep 30"),
        profile("board-b", BUILD_OK, "echo 'I am b'; sleep 0.2; echo PASS; exec sleep 30"),
    ]);

    let a = pipeline.start("board-a", fx.source()).unwrap();
    let b = pipeline.start("board-b", fx.source()).unwrap();
    assert_ne!(a.run_id(), b.run_id());
    let (a, b) = tokio::join!(a.wait(), b.wait());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.verdict, Verdict::Pass);
    assert_eq!(b.verdict, Verdict::Pass);
    assert_eq!(console(&a), vec!["I am a", "PASS"]);
    assert_eq!(console(&b), vec!["I am b", "PASS"]);
    assert_ne!(
        a.artifact.as_ref().unwrap().path,
        b.artifact.as_ref().unwrap().path
    );
}

#[tokio::test]
async fn build_dir_removed_unless_kept() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline_with(vec![profile("board", BUILD_OK, "echo PASS")], false);
    let report = pipeline
        .run("board", &fx.source(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.verdict, Verdict::Pass);
    assert!(!fx
        .build_root()
        .join("board")
        .join(report.run_id.to_string())
        .exists());
}

#[tokio::test]
async fn reload_does_not_affect_run_in_flight() {
    let fx = Fixture::new();
    let registry_dir = fx.path("platforms");
    std::fs::create_dir_all(&registry_dir).unwrap();
    let write = |p: &PlatformProfile| {
        std::fs::write(
            registry_dir.join(format!("{}.profile.toml", p.id)),
            hilrun_profiles::parse::profile_to_toml(p).unwrap(),
        )
        .unwrap();
    };

    let original = profile("board", BUILD_OK, "sleep 0.5; echo PASS; exec sleep 30");
    write(&original);
    let registry = Arc::new(Registry::from_dir(&registry_dir).unwrap());
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&registry),
        PipelineConfig {
            build_root: fx.build_root(),
            keep_build_dirs: true,
        },
    ));
    let handle = pipeline.start("board", fx.source()).unwrap();

    let mut changed = original.clone();
    changed.success_keywords = vec!["NEVER".into()];
    changed.failure_keywords = vec!["PASS".into()];
    write(&changed);
    registry.reload().unwrap();

    let report = handle.wait().await.unwrap();
    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(
        registry.resolve("board").unwrap().failure_keywords,
        vec!["PASS".to_string()]
    );
}

#[tokio::test]
async fn report_archive_round_trips() {
    let fx = Fixture::new();
    let report = run(&fx, profile("board", BUILD_OK, "echo PASS")).await;
    let path = report.archive(&fx.path("reports")).unwrap();
    assert_eq!(RunReport::load(&path).unwrap(), report);
}
