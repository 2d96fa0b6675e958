//! Child-process bootstrap behavior.
//!
//! The SIGCHLD reaper is a one-time-per-process background task tied to
//! whatever runtime first calls [`taskpipe::spawn`]; it does not survive
//! that runtime shutting down. Real programs build one runtime for their
//! whole lifetime, so this is never an issue there — but it means these
//! scenarios must share a single runtime too, hence one `#[tokio::test]`
//! function covering all of them rather than one per scenario. `fork()`
//! also duplicates every thread alive in the process at the moment it's
//! called, so keeping everything on one OS thread keeps that simple too.

use std::time::Duration;

use taskpipe::{pipe, spawn, Error, GetError};

#[tokio::test(flavor = "current_thread")]
async fn child_process_bootstrap_scenarios() {
    child_writes_and_exits_and_parent_observes_all_of_it().await;
    join_with_short_timeout_returns_without_error_while_child_still_runs().await;
    endpoints_not_transferred_are_unusable_in_the_child().await;
    non_transferred_writer_is_actually_closed_not_just_unusable().await;
    grandchild_spawned_inside_a_child_is_reaped().await;
}

async fn child_writes_and_exits_and_parent_observes_all_of_it() {
    let (reader, writer) = pipe::<u32>().unwrap();

    let child_writer = writer.clone();
    let process = spawn(&[&writer], false, Some("writer-child".to_string()), || async move {
        child_writer.put(&42).await.unwrap();
        child_writer.close().unwrap();
        0
    })
    .await
    .unwrap();

    assert_eq!(reader.get(None).await.unwrap(), 42);

    process.join(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(process.exitcode(), Some(0));
    assert!(!process.is_alive());
    assert_eq!(process.name(), "writer-child");

    reader.close().unwrap();
}

async fn join_with_short_timeout_returns_without_error_while_child_still_runs() {
    let process = spawn(&[], false, None, || async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        7
    })
    .await
    .unwrap();

    process.join(Some(Duration::from_millis(20))).await.unwrap();
    assert!(process.is_alive());

    process.join(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(process.exitcode(), Some(7));
}

async fn endpoints_not_transferred_are_unusable_in_the_child() {
    let (kept_reader, kept_writer) = pipe::<u32>().unwrap();
    let (_untransferred_reader, untransferred_writer) = pipe::<u32>().unwrap();

    let child_kept_writer = kept_writer.clone();
    let child_untransferred_writer = untransferred_writer.clone();
    let process = spawn(&[&kept_writer], false, None, move || async move {
        // The untransferred endpoint was pruned during bootstrap: writing
        // through it in the child must fail, not silently succeed.
        let write_result = child_untransferred_writer.put(&1).await;
        let code = if write_result.is_err() { 0 } else { 1 };
        child_kept_writer.put(&99).await.unwrap();
        code
    })
    .await
    .unwrap();

    assert_eq!(kept_reader.get(None).await.unwrap(), 99);
    process.join(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(process.exitcode(), Some(0));
}

/// A write end not listed in `spawn`'s transferred set must have its fd
/// actually closed during child bootstrap, not merely rejected by the
/// owner-pid check on first use. If bootstrap only pruned the registry
/// entry and left the descriptor open, the child's copy would keep the
/// pipe's write side alive for as long as the child runs, and the reader
/// would not see EOF until the child exits rather than as soon as the
/// parent closes its own writer.
async fn non_transferred_writer_is_actually_closed_not_just_unusable() {
    let (reader, writer) = pipe::<u32>().unwrap();
    let child_writer = writer.clone();

    let process = spawn(&[], false, None, move || async move {
        // Never touch child_writer; just keep the process (and whatever
        // fds it inherited) alive well past when the parent expects EOF.
        let _held = child_writer;
        tokio::time::sleep(Duration::from_secs(3)).await;
        0
    })
    .await
    .unwrap();

    writer.close().unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), reader.get(None)).await;
    assert!(
        result.is_ok(),
        "reader should see EOF promptly once the parent's own writer is closed, \
         not have to wait for the still-running child to exit"
    );
    assert!(matches!(
        result.unwrap(),
        Err(GetError::Endpoint(Error::Eof))
    ));

    process.join(Some(Duration::from_secs(5))).await.unwrap();
    reader.close().unwrap();
}

/// A child that itself calls `spawn` to start a grandchild must install its
/// own reaper rather than rely on one inherited (in an already-initialized
/// state) from the parent across `fork()`; otherwise the grandchild's exit
/// is never observed and joining it hangs forever.
async fn grandchild_spawned_inside_a_child_is_reaped() {
    let (reader, writer) = pipe::<u32>().unwrap();
    let child_writer = writer.clone();

    let process = spawn(&[&writer], false, None, move || async move {
        let grandchild = spawn(&[], false, None, || async move { 5 }).await.unwrap();
        grandchild
            .join(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let code = if grandchild.exitcode() == Some(5) { 0 } else { 1 };
        child_writer.put(&1).await.unwrap();
        code
    })
    .await
    .unwrap();

    assert_eq!(reader.get(None).await.unwrap(), 1);
    process.join(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(process.exitcode(), Some(0));
    reader.close().unwrap();
}
