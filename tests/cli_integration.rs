//! Integration tests for the one-shot subcommands

use std::sync::Arc;

use avd_demon::cli;
use avdemon_app::{Engine, Settings};
use avdemon_core::Error;
use avdemon_daemon::test_utils::FakeRunner;
use avdemon_daemon::{CommandOutput, Tool};

fn engine(listing: &str) -> (Engine<FakeRunner>, Arc<FakeRunner>) {
    let runner = Arc::new(FakeRunner::new());
    runner.respond(Tool::Emulator, &["-list-avds"], CommandOutput::ok(listing));
    runner.respond(
        Tool::AvdManager,
        &["list", "avd"],
        CommandOutput::ok(
            "Available Android Virtual Devices:\n\
             \x20   Name: Pixel_7_API_33\n\
             \x20 Device: pixel_7 (Google)\n\
             \x20   Path: /nonexistent/.android/avd/Pixel_7_API_33.avd\n\
             \x20 Target: Google APIs (Google Inc.)\n\
             \x20         Based on: Android 13.0 (Tiramisu) Tag/ABI: google_apis/x86_64\n",
        ),
    );
    runner.set_adb_devices(&[("emulator-5554", "device")]);
    runner.add_running_emulator("emulator-5554", "Pixel_7_API_33");
    (
        Engine::with_runner(Settings::default(), runner.clone()),
        runner,
    )
}

fn text(out: Vec<u8>) -> String {
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn list_prints_table() {
    let (engine, _runner) = engine("Pixel_7_API_33\nSmall_Phone\n");
    let mut out = Vec::new();

    cli::list(&engine, false, &mut out).await.unwrap();

    let text = text(out);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("NAME"));
    assert!(lines[1].starts_with("Pixel_7_API_33"));
    assert!(lines[1].contains("pixel_7 (Google)"));
    assert!(lines[1].ends_with("Running"));
    assert!(lines[2].starts_with("Small_Phone"));
    assert!(lines[2].ends_with("Stopped"));
}

#[tokio::test]
async fn list_json_reports_status_and_images() {
    let (engine, _runner) = engine("Pixel_7_API_33\n");
    let mut out = Vec::new();

    cli::list(&engine, true, &mut out).await.unwrap();

    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["status"], "ready");
    assert_eq!(value["images"][0]["name"], "Pixel_7_API_33");
    assert_eq!(value["images"][0]["metadata_source"], "avd_manager");
    assert_eq!(value["images"][0]["is_running"], true);
}

#[tokio::test]
async fn list_json_with_no_images_carries_placeholder() {
    let (engine, _runner) = engine("");
    let mut out = Vec::new();

    cli::list(&engine, true, &mut out).await.unwrap();

    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["status"], "empty");
    assert_eq!(value["images"].as_array().unwrap().len(), 0);
    assert_eq!(value["placeholder"]["name"], "No_Emulators_Found");
}

#[tokio::test(start_paused = true)]
async fn start_waits_for_confirmation() {
    let (engine, runner) = engine("Pixel_7_API_33\nSmall_Phone\n");
    runner.set_adb_devices(&[]);
    let mut out = Vec::new();

    cli::start(&engine, "Small_Phone", &mut out).await.unwrap();

    assert!(text(out).lines().nth(1).unwrap().ends_with("Running"));
    assert_eq!(runner.count(Tool::Emulator, &["-avd", "Small_Phone"]), 1);
}

#[tokio::test]
async fn start_unknown_image_fails() {
    let (engine, _runner) = engine("Pixel_7_API_33\n");
    let mut out = Vec::new();

    let err = cli::start(&engine, "Missing", &mut out).await.unwrap_err();

    assert!(matches!(err, Error::ImageNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn stop_prints_warning_when_exhausted() {
    let (engine, runner) = engine("Pixel_7_API_33\n");
    runner.respond(
        Tool::Adb,
        &["-s", "emulator-5554", "emu", "kill"],
        CommandOutput::exited("error: device offline", Some(1)),
    );
    runner.respond_any(Tool::Pkill, CommandOutput::exited("", Some(1)));
    let mut out = Vec::new();

    let report = cli::stop(&engine, "Pixel_7_API_33", &mut out).await.unwrap();

    assert!(report.is_exhausted());
    let text = text(out);
    assert!(text.starts_with("warning: No stop method succeeded for 'Pixel_7_API_33'"));
    // Detector still sees it after the settle pass
    assert!(text.lines().last().unwrap().ends_with("Running"));
}
