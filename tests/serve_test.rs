//! Serve command loop tests. These drive [`ServeLoop`] through its command
//! channel, without a network listener.
#![cfg(feature = "service")]

mod common;

use std::time::Duration;

use common::{FakeEngine, Project, RecordingBus};
use pedia_core::{
    engine::Pass,
    messages::{Message, ServerInfoMessage},
    serve::{ServeCommand, ServeLoop},
};
use test_log::test;
use tokio::{sync::mpsc, task::JoinHandle};

fn whole_builds_completed(bus: &RecordingBus) -> usize {
    bus.messages()
        .iter()
        .filter(|m| matches!(m, Message::BuildComplete(c) if c.file.is_none()))
        .count()
}

async fn start(
    project: &Project,
    engine: FakeEngine,
) -> (mpsc::Sender<ServeCommand>, RecordingBus, JoinHandle<()>) {
    let (driver, bus) = project.driver(engine).await;
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(ServeLoop::new(driver, rx).run());
    (tx, bus, handle)
}

async fn finish(handle: JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("serve loop should stop promptly")
        .unwrap();
}

#[test(tokio::test)]
async fn quit_mid_build_cancels_and_announces_once() {
    let project = Project::new();
    project.write("txt/a.tex", "\\Entry{alpha}{Alpha}\n\\slow\n");
    project.write("txt/b.tex", "\\Entry{beta}{Beta}\n");
    let engine = FakeEngine::new();
    let (tx, bus, handle) = start(&project, engine.clone()).await;

    tx.send(ServeCommand::Build).await.unwrap();
    common::wait_for("the slow job to start", || engine.started() >= 2).await;
    tx.send(ServeCommand::Quit).await.unwrap();
    finish(handle).await;

    assert_eq!(bus.count("server_quitting"), 1);
    assert_eq!(bus.messages().last(), Some(&Message::ServerQuitting));
    assert!(!engine.compiled(Pass::First).contains(&"txt/a.tex".to_string()));

    // a later driver over the same cache must recompile the interrupted input
    let engine = FakeEngine::new();
    let (driver, _) = project.driver(engine).await;
    let entries = driver.cache().entries().await.unwrap();
    assert!(!entries.iter().any(|(path, _)| path == "txt/a.tex"), "{entries:?}");
}

#[test(tokio::test)]
async fn connecting_client_gets_server_info_and_a_build() {
    let project = Project::new();
    project.write("txt/a.tex", "\\Entry{alpha}{Alpha}\n");
    let (tx, bus, handle) = start(&project, FakeEngine::new()).await;

    tx.send(ServeCommand::ClientConnected).await.unwrap();
    common::wait_for("the build to finish", || whole_builds_completed(&bus) == 1).await;
    tx.send(ServeCommand::Quit).await.unwrap();
    finish(handle).await;

    let info = bus.messages().into_iter().find_map(|m| match m {
        Message::ServerInfo(info) => Some(info),
        _ => None,
    });
    assert_eq!(
        info,
        Some(ServerInfoMessage {
            app_port: 1234,
            n_workers: 4
        })
    );
    assert!(project.output("alpha.html").is_some());
}

#[test(tokio::test)]
async fn build_requests_during_a_build_queue_one_rebuild() {
    let project = Project::new();
    project.write("txt/a.tex", "\\Entry{alpha}{Alpha}\n");
    project.write("txt/b.tex", "\\Entry{beta}{Beta}\n\\e{alpha}\n");
    let (tx, bus, handle) = start(&project, FakeEngine::new()).await;

    tx.send(ServeCommand::Build).await.unwrap();
    tx.send(ServeCommand::Build).await.unwrap();
    tx.send(ServeCommand::Build).await.unwrap();
    common::wait_for("two builds", || whole_builds_completed(&bus) == 2).await;
    // nothing else is queued
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(ServeCommand::Quit).await.unwrap();
    finish(handle).await;

    assert_eq!(whole_builds_completed(&bus), 2);
    // builds never overlap: every whole-build start follows the previous completion
    let mut open = 0;
    for m in bus.messages() {
        match m {
            Message::BuildStarted(s) if s.file.is_none() => {
                open += 1;
                assert_eq!(open, 1);
            }
            Message::BuildComplete(c) if c.file.is_none() => open -= 1,
            _ => {}
        }
    }
}

#[test(tokio::test)]
async fn changed_files_are_recompiled_even_with_unchanged_digests() {
    let project = Project::new();
    let a = project.write("txt/a.tex", "\\Entry{alpha}{Alpha}\n");
    project.write("txt/b.tex", "\\Entry{beta}{Beta}\n");
    let engine = FakeEngine::new();
    let (tx, bus, handle) = start(&project, engine.clone()).await;

    tx.send(ServeCommand::Build).await.unwrap();
    common::wait_for("first build", || whole_builds_completed(&bus) == 1).await;
    engine.reset();

    tx.send(ServeCommand::FilesChanged(vec![a])).await.unwrap();
    common::wait_for("second build", || whole_builds_completed(&bus) == 2).await;
    tx.send(ServeCommand::Quit).await.unwrap();
    finish(handle).await;

    assert_eq!(engine.compiled(Pass::First), vec!["txt/a.tex"]);
    assert_eq!(engine.compiled(Pass::Second), vec!["txt/a.tex"]);
}

#[test(tokio::test)]
async fn debug_requests_do_not_disturb_the_cache() {
    let project = Project::new();
    project.write("txt/a.tex", "\\Entry{alpha}{Alpha}\n");
    let (tx, bus, handle) = start(&project, FakeEngine::new()).await;

    tx.send(ServeCommand::DebugInput("txt/a.tex".into())).await.unwrap();
    tx.send(ServeCommand::DebugInput("txt/nope.tex".into())).await.unwrap();
    common::wait_for("debug output", || bus.count("input_debug_output") == 1).await;
    common::wait_for("error for the missing input", || !bus.errors().is_empty()).await;
    tx.send(ServeCommand::Quit).await.unwrap();
    finish(handle).await;

    let errors = bus.errors();
    assert_eq!(errors[0].file.as_deref(), Some("txt/nope.tex"));
    assert_eq!(whole_builds_completed(&bus), 0);
}

#[test(tokio::test)]
async fn closing_every_sender_shuts_the_loop_down() {
    let project = Project::new();
    let (tx, bus, handle) = start(&project, FakeEngine::new()).await;
    drop(tx);
    finish(handle).await;
    assert_eq!(bus.messages(), vec![Message::ServerQuitting]);
}
