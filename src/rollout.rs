/*!
The rotating writer.
*/

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use emit::{
    clock::{Clock, ErasedClock},
    platform::system_clock::SystemClock,
};
use time::UtcOffset;

use crate::{
    buffer::DEFAULT_BUFFER_SIZE,
    destination::{self, Identity, Template, TimeFormat, DEFAULT_TEMPLATE, DEFAULT_TIME_FORMAT},
    error,
    file::{Buffer, BufferFn, FileBuffer, DEFAULT_FLUSH_INTERVAL},
    internal_metrics::{InternalMetrics, RolloutMetrics},
};

/**
Rotate every second.
*/
pub const SECONDLY: u64 = 1;

/**
Rotate every minute.
*/
pub const MINUTELY: u64 = 60 * SECONDLY;

/**
Rotate every hour.
*/
pub const HOURLY: u64 = 60 * MINUTELY;

/**
Rotate every day.

Intervals of a day or longer are aligned to midnight at the writer's UTC offset.
*/
pub const DAILY: u64 = 24 * HOURLY;

/**
Rotate every week.
*/
pub const WEEKLY: u64 = 7 * DAILY;

const DEFAULT_ROTATION: u64 = DAILY;
const DEFAULT_KEEPS: usize = 0;

/**
Create a builder for a [`Rollout`] with the default configuration.
*/
pub fn builder() -> RolloutBuilder {
    RolloutBuilder::new()
}

/**
A builder for a [`Rollout`].

Use [`builder`] to begin a [`RolloutBuilder`], then call [`RolloutBuilder::build`] to complete it.
*/
pub struct RolloutBuilder {
    rotation: u64,
    template: String,
    time_format: String,
    root: PathBuf,
    buffer_size: usize,
    flush_interval: Duration,
    keeps: usize,
    zone_offset: Option<UtcOffset>,
    identity: Option<Identity>,
    clock: Box<dyn ErasedClock + Send + Sync>,
    buffer_fn: Box<dyn BufferFn>,
}

impl Default for RolloutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RolloutBuilder {
    /**
    Create a new [`RolloutBuilder`].

    It will use the following defaults:

    - Rotate daily.
    - Name destinations `rollout-{{Time}}.log` with a `[year]-[month]-[day]` time format.
    - Write into the current directory.
    - Buffer up to 4096 bytes, flushing every 10 seconds.
    - Write to files through [`FileBuffer::open`].
    */
    pub fn new() -> Self {
        RolloutBuilder {
            rotation: DEFAULT_ROTATION,
            template: DEFAULT_TEMPLATE.to_owned(),
            time_format: DEFAULT_TIME_FORMAT.to_owned(),
            root: PathBuf::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            keeps: DEFAULT_KEEPS,
            zone_offset: None,
            identity: None,
            clock: Box::new(SystemClock::new()),
            buffer_fn: Box::new(open_file_buffer),
        }
    }

    /**
    Start writing to a new destination every `secs` seconds.

    A value of `0` uses the default of daily rotation.
    */
    pub fn rotate_every_secs(mut self, secs: u64) -> Self {
        self.rotation = if secs == 0 { DEFAULT_ROTATION } else { secs };
        self
    }

    /**
    Start writing to a new destination every second.
    */
    pub fn rotate_secondly(self) -> Self {
        self.rotate_every_secs(SECONDLY)
    }

    /**
    Start writing to a new destination every minute.
    */
    pub fn rotate_minutely(self) -> Self {
        self.rotate_every_secs(MINUTELY)
    }

    /**
    Start writing to a new destination every hour.
    */
    pub fn rotate_hourly(self) -> Self {
        self.rotate_every_secs(HOURLY)
    }

    /**
    Start writing to a new destination at local midnight every day.
    */
    pub fn rotate_daily(self) -> Self {
        self.rotate_every_secs(DAILY)
    }

    /**
    Start writing to a new destination every week.
    */
    pub fn rotate_weekly(self) -> Self {
        self.rotate_every_secs(WEEKLY)
    }

    /**
    The template for destination names.

    See [`Template`] for the available placeholders. If the template fails to parse then the default `rollout-{{Time}}.log` is used.
    */
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /**
    The format for the `{{Time}}` placeholder.

    See [`TimeFormat`] for the syntax. If the format fails to parse then the default `[year]-[month]-[day]` is used.
    */
    pub fn time_format(mut self, time_format: impl Into<String>) -> Self {
        self.time_format = time_format.into();
        self
    }

    /**
    The root that rendered templates are joined onto.

    For the default file buffers this is the directory files are written into. It must already exist.
    */
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /**
    The number of bytes each destination buffers before writing.

    A value of `0` uses the default of 4096.
    */
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        self
    }

    /**
    How often buffered bytes are flushed in the background.

    A zero interval uses the default of 10 seconds.
    */
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = if flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };
        self
    }

    /**
    How many previous destinations to retain.

    This value is recorded but old destinations are never deleted.
    */
    pub fn keeps(mut self, keeps: usize) -> Self {
        self.keeps = keeps;
        self
    }

    /**
    The fixed UTC offset used to align daily and weekly rotation and to render `{{Time}}`.

    If unset, the local offset at the time the writer is built is used. On platforms where it can't be determined, UTC is used.
    */
    pub fn zone_offset(mut self, zone_offset: UtcOffset) -> Self {
        self.zone_offset = Some(zone_offset);
        self
    }

    /**
    The process identity substituted into `{{Host}}` and `{{Pid}}`.

    If unset, [`Identity::current`] is used.
    */
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /**
    The source of time used to pick rotation buckets.
    */
    pub fn clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /**
    The factory used to create a [`Buffer`] for each new destination.
    */
    pub fn buffer_fn(
        mut self,
        buffer_fn: impl Fn(&Path, usize, Duration) -> io::Result<Box<dyn Buffer + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.buffer_fn = Box::new(buffer_fn);
        self
    }

    /**
    Complete the builder, returning a [`Rollout`].

    This method doesn't fail. Invalid templates and time formats are replaced by their defaults, which is reported to [`emit::runtime::internal`].
    */
    pub fn build(self) -> Rollout {
        let template = Template::parse(&self.template).unwrap_or_else(|err| {
            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to parse template {template}, using the default: {err}",
                #[emit::as_debug]
                template: self.template,
                err,
            );

            Template::default()
        });

        let time_format = TimeFormat::parse(&self.time_format).unwrap_or_else(|err| {
            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to parse time format {time_format}, using the default: {err}",
                #[emit::as_debug]
                time_format: self.time_format,
                err,
            );

            TimeFormat::default()
        });

        let zone_offset = self
            .zone_offset
            .unwrap_or_else(|| local_offset(self.clock.now()));

        Rollout {
            rotation: self.rotation,
            template,
            time_format,
            root: self.root,
            buffer_size: self.buffer_size,
            flush_interval: self.flush_interval,
            keeps: self.keeps,
            zone_offset,
            identity: self.identity.unwrap_or_else(Identity::current),
            clock: self.clock,
            buffer_fn: self.buffer_fn,
            metrics: Arc::new(InternalMetrics::default()),
            state: RwLock::new(State {
                active: None,
                closed: false,
            }),
        }
    }
}

fn open_file_buffer(
    dest: &Path,
    size: usize,
    interval: Duration,
) -> io::Result<Box<dyn Buffer + Send + Sync>> {
    Ok(Box::new(FileBuffer::open(dest, size, interval)?))
}

fn local_offset(now: Option<emit::Timestamp>) -> UtcOffset {
    now.and_then(|now| destination::to_offset_date_time(now, UtcOffset::UTC))
        .and_then(|now| UtcOffset::local_offset_at(now).ok())
        .unwrap_or(UtcOffset::UTC)
}

/**
A writer that redirects its input to a new destination on a fixed interval.

Each rotation interval is a bucket. The first write into a new bucket creates a [`Buffer`] for it, and closes the one used for the previous bucket. Writes are batched in memory by the buffer and flushed when it fills, periodically in the background, and when the writer is closed.

A [`Rollout`] can be shared between threads. It implements [`io::Write`] both directly and through a shared reference.

Call [`Rollout::close`] before the process exits so buffered bytes are written. Dropping a [`Rollout`] also closes it.
*/
pub struct Rollout {
    rotation: u64,
    template: Template,
    time_format: TimeFormat,
    root: PathBuf,
    buffer_size: usize,
    flush_interval: Duration,
    keeps: usize,
    zone_offset: UtcOffset,
    identity: Identity,
    clock: Box<dyn ErasedClock + Send + Sync>,
    buffer_fn: Box<dyn BufferFn>,
    metrics: Arc<InternalMetrics>,
    state: RwLock<State>,
}

struct State {
    active: Option<ActiveBuffer>,
    closed: bool,
}

struct ActiveBuffer {
    buffer: Box<dyn Buffer + Send + Sync>,
    bucket: i64,
    dest: PathBuf,
}

impl Rollout {
    /**
    Write `buf` to the destination for the current rotation bucket.

    If the bucket has changed since the last write then a new destination is created first. If that fails the error is returned, nothing is written, and the previous destination stays active.
    */
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // NOTE: This is a best-effort check so writers don't contend on the
        // exclusive lock after the writer is closed. A concurrent close can
        // still land between here and taking the exclusive lock below
        if self.state.read().unwrap().closed {
            self.metrics.write_closed.increment();

            return Err(error::closed());
        }

        let mut state = self.state.write().unwrap();

        // A close that raced the check above has already released the active
        // buffer, so don't create a new one in its place
        if state.closed {
            self.metrics.write_closed.increment();

            return Err(error::closed());
        }

        let now = self.now()?;
        let bucket = self.bucket(now);

        let active = match state.active.take() {
            Some(active) if active.bucket == bucket => active,
            previous => {
                let active = match self.create(now, bucket) {
                    Ok(active) => active,
                    Err(err) => {
                        state.active = previous;

                        return Err(err);
                    }
                };

                if let Some(previous) = previous {
                    emit::debug!(
                        rt: emit::runtime::internal(),
                        "rotating from {from} to {to}",
                        #[emit::as_debug]
                        from: previous.dest,
                        #[emit::as_debug]
                        to: active.dest,
                    );

                    if let Err(err) = self.close_buffer(previous) {
                        emit::warn!(
                            rt: emit::runtime::internal(),
                            "failed to close the previous destination: {err}",
                            err,
                        );
                    }
                }

                active
            }
        };

        let written = active.buffer.write(buf);
        state.active = Some(active);

        written
    }

    /**
    Flush any buffered bytes in the active destination.

    If nothing has been written yet, or the writer is closed, this is a no-op.
    */
    pub fn flush(&self) -> io::Result<()> {
        match self.state.read().unwrap().active {
            Some(ref active) => active.buffer.flush(),
            None => Ok(()),
        }
    }

    /**
    Close the writer, flushing and releasing the active destination.

    After this call every [`Rollout::write`] fails with an error that satisfies [`crate::is_closed`]. Closing an already closed writer does nothing.
    */
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.state.write().unwrap();

        if state.closed {
            return Ok(());
        }

        state.closed = true;

        match state.active.take() {
            Some(active) => self.close_buffer(active),
            None => Ok(()),
        }
    }

    /**
    Whether [`Rollout::close`] has been called.
    */
    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap().closed
    }

    /**
    The rotation bucket `ts` falls in.

    For intervals of a day or longer the writer's UTC offset is added first, so buckets begin at local midnight. Shorter intervals use UTC directly. Buckets are only comparable between timestamps given to the same writer.
    */
    pub fn bucket(&self, ts: emit::Timestamp) -> i64 {
        bucket(ts, self.rotation, self.zone_offset)
    }

    /**
    The destination `ts` resolves to.
    */
    pub fn destination(&self, ts: emit::Timestamp) -> PathBuf {
        destination::resolve(
            &self.root,
            &self.template,
            ts,
            self.zone_offset,
            &self.time_format,
            &self.identity,
        )
    }

    /**
    The rotation interval in seconds.
    */
    pub fn rotation_secs(&self) -> u64 {
        self.rotation
    }

    /**
    The number of bytes each destination buffers.
    */
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /**
    How often destinations flush in the background.
    */
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /**
    The format used for the `{{Time}}` placeholder.
    */
    pub fn time_format(&self) -> &TimeFormat {
        &self.time_format
    }

    /**
    The template used for destination names.
    */
    pub fn template(&self) -> &Template {
        &self.template
    }

    /**
    The root destinations are joined onto.
    */
    pub fn root(&self) -> &Path {
        &self.root
    }

    /**
    The configured number of destinations to retain.

    Nothing is deleted based on this value.
    */
    pub fn keeps(&self) -> usize {
        self.keeps
    }

    /**
    The fixed UTC offset captured when the writer was built.
    */
    pub fn zone_offset(&self) -> UtcOffset {
        self.zone_offset
    }

    /**
    Get an [`emit::metric::Source`] for instrumentation produced by the writer.
    */
    pub fn metric_source(&self) -> RolloutMetrics {
        RolloutMetrics {
            metrics: self.metrics.clone(),
        }
    }

    fn now(&self) -> io::Result<emit::Timestamp> {
        self.clock
            .now()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "the clock is unavailable"))
    }

    fn create(&self, now: emit::Timestamp, bucket: i64) -> io::Result<ActiveBuffer> {
        let dest = self.destination(now);

        match (self.buffer_fn)(&dest, self.buffer_size, self.flush_interval) {
            Ok(buffer) => {
                self.metrics.buffer_create.increment();

                emit::debug!(
                    rt: emit::runtime::internal(),
                    "created {path} for bucket {bucket}",
                    #[emit::as_debug]
                    path: dest,
                    bucket,
                );

                Ok(ActiveBuffer {
                    buffer,
                    bucket,
                    dest,
                })
            }
            Err(err) => {
                self.metrics.buffer_create_failed.increment();

                Err(err)
            }
        }
    }

    fn close_buffer(&self, active: ActiveBuffer) -> io::Result<()> {
        match active.buffer.close() {
            Ok(()) => {
                self.metrics.buffer_close.increment();

                emit::debug!(
                    rt: emit::runtime::internal(),
                    "closed {path}",
                    #[emit::as_debug]
                    path: active.dest,
                );

                Ok(())
            }
            Err(err) => {
                self.metrics.buffer_close_failed.increment();

                Err(err)
            }
        }
    }
}

impl Drop for Rollout {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Rollout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rollout")
            .field("rotation", &self.rotation)
            .field("template", &self.template)
            .field("time_format", &self.time_format)
            .field("root", &self.root)
            .field("buffer_size", &self.buffer_size)
            .field("flush_interval", &self.flush_interval)
            .field("keeps", &self.keeps)
            .field("zone_offset", &self.zone_offset)
            .finish_non_exhaustive()
    }
}

impl io::Write for Rollout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Rollout::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Rollout::flush(self)
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        write_rendered(self, args)
    }
}

impl<'a> io::Write for &'a Rollout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Rollout::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Rollout::flush(self)
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        write_rendered(self, args)
    }
}

// Formatted input reaches the writer as one write, not one per fragment
fn write_rendered(rollout: &Rollout, args: fmt::Arguments<'_>) -> io::Result<()> {
    let rendered = match args.as_str() {
        Some(literal) => literal.to_owned(),
        None => fmt::format(args),
    };

    let mut buf = rendered.as_bytes();
    while !buf.is_empty() {
        match rollout.write(buf) {
            Ok(0) => return Err(error::short_write()),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn bucket(ts: emit::Timestamp, rotation: u64, zone_offset: UtcOffset) -> i64 {
    let mut secs = ts.to_unix().as_secs() as i64;

    if rotation >= DAILY {
        secs += i64::from(zone_offset.whole_seconds());
    }

    secs.div_euclid(i64::try_from(rotation).unwrap_or(i64::MAX))
}
