use std::{
    os::raw::c_int,
    sync::atomic::{AtomicBool, Ordering},
};

macro_rules! fxhashmap {
    ($($key:expr => $value:expr,)+) => { fxhashmap!($($key => $value),+) };
    ($($key:expr => $value:expr),*) => {
        {
            let mut _map = ::rustc_hash::FxHashMap::default();
            $(
                let _ = _map.insert($key, $value);
            )*
            _map.shrink_to_fit();
            _map
        }
    };
}

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

fn named_signal(sig: c_int) -> String {
    signal_hook::low_level::signal_name(sig)
        .map(|n| format!("{}({})", n, sig))
        .unwrap_or_else(|| sig.to_string())
}

/// Requests stop on the first termination signal.
pub fn setup_signal_handler() -> std::io::Result<()> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    std::thread::spawn(move || {
        if let Some(info) = signals.forever().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}, waiting workers to exit...",
                named_signal(info.signal),
                from,
                info.cause
            );
            stop_req();
        }
    });
    Ok(())
}
