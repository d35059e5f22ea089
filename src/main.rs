use realtalk::console::ConsoleSink;
use realtalk::credential::HttpCredentialFetcher;
use realtalk::provider::session::{self, SessionConfig, SessionHandle};
use realtalk::scheduler::{self, Schedule};
use realtalk::settings::{self, Settings};
use realtalk::transport::rtc::RtcNegotiator;
use realtalk::audio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "commands: /start  /stop  /status  /devices  /quit  (anything else is sent as a message)";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = settings::load();
    match settings::settings_path() {
        Ok(path) if !path.exists() => match settings::save(&settings) {
            Ok(()) => log::info!("[settings] wrote defaults to {}", path.display()),
            Err(e) => log::warn!("[settings] could not write defaults: {}", e),
        },
        Ok(_) => {}
        Err(e) => log::warn!("[settings] {}", e),
    }
    log::info!(
        "[realtalk] model={} token_url={}",
        settings.model,
        settings.token_url
    );

    let credentials = Arc::new(HttpCredentialFetcher::new(&settings.token_url));
    let negotiator = Arc::new(RtcNegotiator::from_settings(&settings));
    let (handle, session_task) = session::spawn(
        SessionConfig::from(&settings),
        credentials,
        negotiator,
        Box::new(ConsoleSink::stdout()),
    );

    let scheduler_task = start_scheduler(&settings, handle.clone());

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !dispatch(line.trim(), &handle).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("[realtalk] reading stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("[realtalk] interrupted");
                break;
            }
        }
    }

    if let Some(task) = scheduler_task {
        task.abort();
    }
    handle.shutdown();
    if let Err(e) = session_task.await {
        log::error!("[realtalk] session task failed: {}", e);
    }
}

fn start_scheduler(settings: &Settings, handle: SessionHandle) -> Option<tokio::task::JoinHandle<()>> {
    if !settings.schedule.enabled {
        log::info!("[scheduler] disabled");
        return None;
    }
    match Schedule::from_settings(&settings.schedule) {
        Ok(schedule) => Some(scheduler::spawn(
            schedule,
            settings.schedule.check_interval(),
            handle,
        )),
        Err(e) => {
            log::warn!("[scheduler] {}; scheduler disabled", e);
            None
        }
    }
}

/// Returns false when the user asked to quit.
async fn dispatch(line: &str, handle: &SessionHandle) -> bool {
    match line {
        "" => {}
        "/quit" | "/exit" => return false,
        "/start" => {
            handle.start();
        }
        "/stop" => {
            handle.stop();
        }
        "/status" => match handle.snapshot().await {
            Some(s) => println!(
                "phase={:?} active={} ai_speaking={} reconnect_attempts={} events={}",
                s.phase,
                s.active,
                s.ai_speaking,
                s.reconnect_attempts,
                s.events.len()
            ),
            None => return false,
        },
        "/devices" => {
            println!("inputs:");
            for name in audio::list_input_devices() {
                println!("  {}", name);
            }
            println!("outputs:");
            for name in audio::list_output_devices() {
                println!("  {}", name);
            }
        }
        "/help" => println!("{}", HELP),
        text => {
            handle.send_text(text);
        }
    }
    true
}
