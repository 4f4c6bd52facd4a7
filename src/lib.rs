/*!
A rotating, buffered writer that starts a new destination on a fixed time interval.

Writes are batched in memory and flushed when the buffer fills, periodically on a background thread, and when the writer is closed. Every rotation interval (second, minute, hour, day, week, or any number of seconds) gets its own destination, named from a template.

# Getting started

Add `rollout` to your `Cargo.toml`:

```toml
[dependencies.rollout]
version = "0.1.0"
```

Build a writer and write to it from any thread. Formatted writes through [`std::io::Write::write_fmt`] are rendered first and handed to the writer in a single call, so lines from different threads don't interleave:

```no_run
use std::io::Write;

fn main() -> std::io::Result<()> {
    let log = rollout::builder()
        .root("./target/logs")
        .template("my_app-{{Time}}.log")
        .rotate_hourly()
        .time_format("[year]-[month]-[day]T[hour]")
        .build();

    writeln!(&log, "Hello, {}", "world")?;

    log.close()
}
```

Call [`Rollout::close`] before your application exits. Bytes still sitting in the buffer are only written when it fills, on the next flush interval, or on close.

# Destination naming

Destinations are named by rendering a [`Template`] and joining it onto the configured root. Templates support the following placeholders:

- `{{Time}}`: The time of the write that opened the destination, rendered with the configured [`TimeFormat`] at the writer's UTC offset.
- `{{Host}}`: A stable hex identifier derived from the machine's hostname.
- `{{Pid}}`: The current process id.

Given the template `app-{{Host}}-{{Pid}}-{{Time}}.log` and the default `[year]-[month]-[day]` time format, a destination could look like:

```text
app-9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08-4812-2024-05-27.log
```

# Rotation

Intervals shorter than a day are aligned to UTC. Daily and weekly intervals are aligned to midnight at the writer's UTC offset, which defaults to the local offset when the writer is built.

Rotation happens lazily, on the first write into a new interval. The destination for the previous interval is flushed and closed at that point. Old destinations are never deleted.

# Custom destinations

Each destination is a [`Buffer`], created by a factory set with [`RolloutBuilder::buffer_fn`]. The default factory opens files for appending through [`FileBuffer::open`]. A [`FileBuffer`] can also wrap any [`std::io::Write`].

# Troubleshooting

Failures that can't be returned to a caller, like failing to flush on the background interval, are written to `emit`'s internal runtime. You can configure it with [`emit::Setup::init_internal`]:

```
fn main() {
    let internal_rt = emit::setup()
        .emit_to(emit_term::stdout())
        .init_internal();

    // Your app code goes here
}
```

[`Rollout::metric_source`] exposes counters for destinations created, closed, and failed, and for writes rejected after close.
*/

#![deny(missing_docs)]

mod buffer;
mod destination;
mod error;
mod file;
mod internal_metrics;
mod rollout;

pub use self::{
    buffer::{BufferWriter, DEFAULT_BUFFER_SIZE},
    destination::{
        resolve, Identity, Template, TimeFormat, DEFAULT_TEMPLATE, DEFAULT_TIME_FORMAT,
    },
    error::{is_closed, Closed, Error},
    file::{Buffer, BufferFn, FileBuffer, DEFAULT_FLUSH_INTERVAL},
    internal_metrics::*,
    rollout::{builder, Rollout, RolloutBuilder, DAILY, HOURLY, MINUTELY, SECONDLY, WEEKLY},
};
