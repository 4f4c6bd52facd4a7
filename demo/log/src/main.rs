/*!
Write lines from a few threads into a daily log file in the current directory.
*/

use std::{io::Write, sync::Arc, thread, time::Duration};

fn main() {
    // Report opened, rotated, and closed files to the console
    let internal_rt = emit::setup().emit_to(emit_term::stdout()).init_internal();

    let log = Arc::new(
        rollout::builder()
            .rotate_daily()
            .template("test-{{Time}}.log")
            .build(),
    );

    let writers = (0..5)
        .map(|i| {
            let log = log.clone();

            thread::spawn(move || {
                for _ in 0..10 {
                    if let Err(err) = writeln!(&*log, "{i} - OK") {
                        eprintln!("failed to write: {err}");
                    }

                    thread::sleep(Duration::from_secs(1));
                }
            })
        })
        .collect::<Vec<_>>();

    for writer in writers {
        let _ = writer.join();
    }

    if let Err(err) = log.close() {
        eprintln!("failed to close: {err}");
    }

    internal_rt.blocking_flush(Duration::from_secs(5));
}
