/*!
A simple integration test of writing lines to files rotated every second.
*/

use std::{io::Write, sync::Arc, thread, time::Duration};

fn main() {
    if std::path::Path::new("./logs").exists() {
        std::fs::remove_dir_all("./logs").unwrap();
    }
    std::fs::create_dir_all("./logs").unwrap();

    let _ = emit::setup().emit_to(emit_term::stdout()).init_internal();

    let log = Arc::new(
        rollout::builder()
            .root("./logs")
            .template("test-{{Pid}}-{{Time}}.log")
            .time_format("[year]-[month]-[day]T[hour]-[minute]-[second]")
            .rotate_secondly()
            .buffer_size(512)
            .flush_interval(Duration::from_millis(100))
            .build(),
    );

    let threads = 8;
    let per_thread = 2_500;

    // Write our lines, spread over a few seconds
    let writers = (0..threads)
        .map(|t| {
            let log = log.clone();

            thread::spawn(move || {
                for i in 0..per_thread {
                    writeln!(&*log, "Line #{i} from thread {t}").unwrap();

                    if i % 500 == 0 {
                        thread::sleep(Duration::from_millis(300));
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for writer in writers {
        writer.join().unwrap();
    }

    log.close().unwrap();

    emit::emit!(
        rt: emit::runtime::internal(),
        "created {buffer_create} files",
        buffer_create: log.metric_source().buffer_create(),
    );

    // Ensure all lines were written intact
    let mut files = 0;
    let mut read_count = 0;
    for f in std::fs::read_dir("./logs").unwrap() {
        let f = f.unwrap();
        files += 1;

        let contents = std::fs::read_to_string(f.path()).unwrap();

        for line in contents.lines() {
            assert!(line.starts_with("Line #"), "unexpected line {line:?}");
            read_count += 1;
        }
    }

    assert_eq!(threads * per_thread, read_count, "unexpected total line count");
    assert_eq!(
        log.metric_source().buffer_create(),
        files,
        "unexpected file count"
    );
    assert!(files > 1, "expected at least one rotation");
}
