mod common;

use common::{count, drain, finish, next_named, sh_config, start, write_script};
use serde_json::json;
use script_supervisor::{Event, SupervisorBuilder, Termination};

#[tokio::test]
async fn child_restart_command_relaunches_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "selfrestart.sh",
        "if [ ! -e ran ]; then\n  touch ran\n  echo RESTART >&3\nfi\nexec sleep 30",
    );
    let mut run = start(SupervisorBuilder::new(sh_config(&script)));
    let mut watch = run.handle.subscribe();

    run.handle.launch().await.unwrap();
    next_named(&mut watch, "start").await;
    next_named(&mut watch, "start").await;

    let status = run.handle.status().await.unwrap();
    assert!(status.monitoring);
    assert!(status.pid.is_some());

    run.handle.kill_child_process().unwrap();
    assert_eq!(finish(&run.handle).await, Termination::Shutdown);

    let events = drain(&mut run.events);
    let second_start = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.name() == "start")
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    let before = &events[..second_start];
    assert_eq!(count(before, "exit"), 1);
    assert_eq!(count(before, "starting"), 2);
    assert!(before.contains(&Event::Message(json!("RESTART"))));
    assert_eq!(count(&events, "childmessage"), 0);
    assert!(run.log.contains("Script restarted itself"));
}

#[tokio::test]
async fn child_stop_command_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "selfstop.sh", "echo STOP >&3\nexec sleep 30");
    let mut run = start(SupervisorBuilder::new(sh_config(&script)));

    run.handle.launch().await.unwrap();
    assert_eq!(finish(&run.handle).await, Termination::Shutdown);

    let events = drain(&mut run.events);
    assert_eq!(count(&events, "starting"), 1);
    assert_eq!(count(&events, "message"), 1);
    assert!(run.log.contains("Script stopped itself"));
}

#[tokio::test]
async fn start_from_running_child_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "selfstart.sh", "echo START >&3\nexec sleep 30");
    let mut run = start(SupervisorBuilder::new(sh_config(&script)));

    run.handle.launch().await.unwrap();
    next_named(&mut run.events, "message").await;
    let status = run.handle.status().await.unwrap();
    assert_eq!(status.starts, 1);

    run.handle.kill_child_process().unwrap();
    assert_eq!(finish(&run.handle).await, Termination::Shutdown);
    assert!(run.log.contains("warn: START ignored"));
}

#[tokio::test]
async fn payloads_travel_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "echo.sh",
        "echo \"greeting=$GREETING fd=$SUPERVISOR_CHANNEL_FD\"\n\
         echo oops >&2\n\
         read line <&3\n\
         echo \"{\\\"echo\\\":$line}\" >&3\n\
         echo plain words >&3\n\
         exec sleep 30",
    );
    let mut cfg = sh_config(&script);
    cfg.env.insert("GREETING".into(), "hello".into());
    let run = start(SupervisorBuilder::new(cfg));
    let mut stdout = run.handle.subscribe();
    let mut stderr = run.handle.subscribe();
    let mut messages = run.handle.subscribe();

    run.handle.launch().await.unwrap();
    run.handle.send_message(&json!({"n": 1})).await.unwrap();

    assert_eq!(
        next_named(&mut stdout, "stdout").await,
        Event::Stdout("greeting=hello fd=3".into())
    );
    assert_eq!(next_named(&mut stderr, "stderr").await, Event::Stderr("oops".into()));
    assert_eq!(
        next_named(&mut messages, "childmessage").await,
        Event::ChildMessage(json!({"echo": {"n": 1}}))
    );
    assert_eq!(
        next_named(&mut messages, "childmessage").await,
        Event::ChildMessage(json!("plain words"))
    );

    run.handle.kill_child_process().unwrap();
    assert_eq!(finish(&run.handle).await, Termination::Shutdown);
    assert!(run.log.contains("error: oops"));
    assert!(std::env::var("GREETING").is_err());
}

#[tokio::test]
async fn non_utf8_environment_reaches_the_child() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    std::env::set_var(
        OsStr::from_bytes(b"SUPERVISOR_TEST_RAW_ENV"),
        OsStr::from_bytes(&[0xff, 0xfe]),
    );
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "env.sh",
        "printf 'raw=%s\\n' \"${#SUPERVISOR_TEST_RAW_ENV}\"\necho \"mode=$MODE\"\nexec sleep 30",
    );
    let mut cfg = sh_config(&script);
    cfg.env.insert("MODE".into(), "test".into());
    let run = start(SupervisorBuilder::new(cfg));
    let mut started = run.handle.subscribe();
    let mut stdout = run.handle.subscribe();

    run.handle.launch().await.unwrap();
    assert!(matches!(next_named(&mut started, "start").await, Event::Start(Some(_))));
    assert_eq!(next_named(&mut stdout, "stdout").await, Event::Stdout("raw=2".into()));
    assert_eq!(next_named(&mut stdout, "stdout").await, Event::Stdout("mode=test".into()));

    run.handle.kill_child_process().unwrap();
    assert_eq!(finish(&run.handle).await, Termination::Shutdown);
}
