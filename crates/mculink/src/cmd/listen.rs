use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mculink_dict::MessageParams;
use mculink_mcu::ResponseHandler;

use crate::cmd::ListenArgs;
use crate::exit::{CliError, CliResult, MCU_SHUTDOWN, SUCCESS};
use crate::output::{print_message, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mcu = args.device.connect()?;
    let shutdown = mcu.shutdown_events();

    let (tx, rx) = mpsc::channel::<MessageParams>();
    let tx = Mutex::new(tx);
    let forward: ResponseHandler = Arc::new(move |params: &MessageParams| {
        let _ = tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(params.clone());
    });
    mcu.handler().set_default_handler(Some(forward));

    let mut printed = 0usize;
    let mut code = SUCCESS;
    while running.load(Ordering::SeqCst) {
        if let Ok(event) = shutdown.try_recv() {
            eprintln!("{event}");
            code = MCU_SHUTDOWN;
            break;
        }
        let params = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(params) => params,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        print_message(&params, &mcu.dictionary(), mcu.name(), format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    mcu.handler().set_default_handler(None);
    mcu.disconnect();
    Ok(code)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
