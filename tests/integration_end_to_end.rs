use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use ws_stress::{
    handle::{WorkerCommand, WORKER_FLAG},
    Args, LoadTestConfig, Orchestrator, ProcfsCollector, ReportLog,
};

/// Accept WebSocket connections and discard everything they send.
async fn start_sink_server() -> Result<(String, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    while let Some(Ok(_)) = ws.next().await {}
                }
            });
        }
    });

    Ok((addr.to_string(), accepted))
}

/// Three workers with two connections each, 1000 byte frames every 300ms,
/// five one-second windows. Every window should add roughly
/// 3 x 2 x (1s / 0.3s) = 20 frames.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_workers_stream_to_local_server() -> Result<()> {
    let (server, accepted) = start_sink_server().await?;
    let report_file = NamedTempFile::new()?;
    let output_file = NamedTempFile::new()?;

    let args = Args::try_parse_from([
        "ws-stress",
        "-i",
        "3",
        "-c",
        "2",
        "-s",
        "1000",
        "-d",
        "1",
        "--iterations",
        "5",
        "--frame-interval",
        "300ms",
        "-w",
        server.as_str(),
    ])?;
    let config = LoadTestConfig::from_args(&args)?;
    let command = WorkerCommand::new(env!("CARGO_BIN_EXE_ws-stress"), [WORKER_FLAG]);
    let report = ReportLog::open(report_file.path())?;

    let mut orchestrator =
        Orchestrator::spawn(&command, config, Box::new(ProcfsCollector), report).await?;
    let summary = orchestrator.run().await?;

    assert_eq!(summary.worker_pids.len(), 3);
    assert_eq!(accepted.load(Ordering::SeqCst), 6);
    assert_eq!(summary.iterations.len(), 5);

    for entry in &summary.iterations {
        assert_eq!(entry.per_worker.len(), 3);
        assert!(
            (12..=30).contains(&entry.window.frames),
            "window {} added {} frames",
            entry.index,
            entry.window.frames
        );
        assert_eq!(entry.totals.bytes, entry.totals.frames * 1000);
        assert_eq!(entry.window.bytes, entry.window.frames * 1000);
    }

    let last = summary.iterations[4].totals;
    let final_report = summary.final_report.clone().expect("final report");
    assert!(final_report.totals >= last);
    assert_eq!(final_report.totals.bytes, final_report.totals.frames * 1000);
    assert_eq!(final_report.skew.windows, 5);

    // Workers are gone once run() returns
    #[cfg(target_os = "linux")]
    for pid in &summary.worker_pids {
        let statm = std::path::PathBuf::from(format!("/proc/{}/statm", pid));
        assert!(!statm.exists(), "worker {} survived the run", pid);
    }

    let contents = std::fs::read_to_string(report_file.path())?;
    assert_eq!(contents.matches("time from last report").count(), 5);
    assert!(contents.contains("Total memory usage at start:"));

    summary.write_json(output_file.path())?;
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(output_file.path())?)?;
    assert_eq!(json["iterations"].as_array().map(|a| a.len()), Some(5));
    Ok(())
}
