/*!
Thread-safe buffered destinations.

A [`Buffer`] is the destination a [`crate::Rollout`] writes a single rotation bucket into. The built-in [`FileBuffer`] wraps a sink in a [`BufferWriter`] and flushes it periodically on a background thread.
*/

use std::{
    fs,
    io::{self, Write},
    path::Path,
    sync::{Arc, Condvar, Mutex, RwLock},
    thread,
    time::{Duration, Instant},
};

use crate::buffer::BufferWriter;

/**
The default interval buffered bytes are flushed on.
*/
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/**
A destination for a single rotation bucket.

Implementations are internally synchronized, so all methods take `&self`. [`Buffer::write`] and [`Buffer::flush`] may be called concurrently from different threads. [`Buffer::close`] is called at most once by [`crate::Rollout`].
*/
pub trait Buffer {
    /**
    Write some bytes, returning how many were accepted.
    */
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /**
    Write any buffered bytes to the underlying destination.
    */
    fn flush(&self) -> io::Result<()>;

    /**
    Flush any buffered bytes and release the underlying destination.
    */
    fn close(&self) -> io::Result<()>;
}

impl<'a, B: Buffer + ?Sized> Buffer for &'a B {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

impl<B: Buffer + ?Sized> Buffer for Box<B> {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

impl<B: Buffer + ?Sized> Buffer for Arc<B> {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

/**
A factory for new [`Buffer`]s.

It's given the resolved destination, the buffer size in bytes, and the flush interval. The default is [`FileBuffer::open`].
*/
pub trait BufferFn:
    Fn(&Path, usize, Duration) -> io::Result<Box<dyn Buffer + Send + Sync>> + Send + Sync
{
}

impl<F> BufferFn for F where
    F: Fn(&Path, usize, Duration) -> io::Result<Box<dyn Buffer + Send + Sync>> + Send + Sync
{
}

/**
A thread-safe [`BufferWriter`] over a sink, flushed on a fixed interval.

Every operation serializes through a single lock. A background thread wakes every flush interval and, if anything is buffered, flushes it. The thread is stopped when the buffer is closed or dropped.
*/
pub struct FileBuffer<W: Write + Send + Sync + 'static = fs::File> {
    shared: Arc<RwLock<Option<BufferWriter<W>>>>,
    flusher: Mutex<Option<Flusher>>,
}

impl FileBuffer<fs::File> {
    /**
    Open `dest` for appending, creating it if it doesn't exist.

    On Unix platforms new files are created with `0o644` permissions.
    */
    pub fn open(dest: &Path, size: usize, interval: Duration) -> io::Result<Self> {
        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;

            options.mode(0o644);
        }

        let file = options.open(dest)?;

        emit::debug!(
            rt: emit::runtime::internal(),
            "opened {path}",
            #[emit::as_debug]
            path: &dest,
        );

        FileBuffer::new(file, size, interval)
    }
}

impl<W: Write + Send + Sync + 'static> FileBuffer<W> {
    /**
    Wrap `sink` in a buffer holding up to `size` bytes, flushed every `interval`.

    A `size` of `0` uses [`crate::DEFAULT_BUFFER_SIZE`]. An `interval` of zero uses [`DEFAULT_FLUSH_INTERVAL`].

    This fails if the background flushing thread can't be spawned.
    */
    pub fn new(sink: W, size: usize, interval: Duration) -> io::Result<Self> {
        let interval = if interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            interval
        };

        let shared = Arc::new(RwLock::new(Some(BufferWriter::with_capacity(size, sink))));

        let flusher = Flusher::spawn(interval, {
            let shared = shared.clone();

            move || flush_if_buffered(&shared)
        })?;

        Ok(FileBuffer {
            shared,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /**
    The number of bytes waiting to be flushed.
    */
    pub fn buffered(&self) -> usize {
        self.shared
            .read()
            .unwrap()
            .as_ref()
            .map(|writer| writer.buffered())
            .unwrap_or(0)
    }

    /**
    Whether the buffer has been closed.
    */
    pub fn is_closed(&self) -> bool {
        self.shared.read().unwrap().is_none()
    }

    fn stop_flusher(&self) {
        if let Some(flusher) = self.flusher.lock().unwrap().take() {
            flusher.stop();
        }
    }
}

impl<W: Write + Send + Sync + 'static> Buffer for FileBuffer<W> {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match *self.shared.write().unwrap() {
            Some(ref mut writer) => writer.write(buf),
            None => Err(crate::error::closed()),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match *self.shared.write().unwrap() {
            Some(ref mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn close(&self) -> io::Result<()> {
        // Stop the timer before taking the lock; it may be waiting on it to flush
        self.stop_flusher();

        let Some(mut writer) = self.shared.write().unwrap().take() else {
            return Ok(());
        };

        let flushed = writer.flush();

        // Dropping the sink releases it
        drop(writer.into_inner());

        flushed
    }
}

impl<W: Write + Send + Sync + 'static> Drop for FileBuffer<W> {
    fn drop(&mut self) {
        let _ = <Self as Buffer>::close(self);
    }
}

fn flush_if_buffered<W: Write>(shared: &RwLock<Option<BufferWriter<W>>>) {
    let pending = shared
        .read()
        .unwrap()
        .as_ref()
        .map(|writer| writer.buffered() > 0)
        .unwrap_or(false);

    if !pending {
        return;
    }

    if let Some(ref mut writer) = *shared.write().unwrap() {
        if let Err(err) = writer.flush() {
            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to flush buffer on interval: {err}",
                err,
            );
        }
    }
}

/**
A background thread that calls a function on a fixed interval until stopped.
*/
struct Flusher {
    stop: Trigger,
    handle: thread::JoinHandle<()>,
}

impl Flusher {
    fn spawn(interval: Duration, mut on_tick: impl FnMut() + Send + 'static) -> io::Result<Self> {
        let stop = Trigger::new();

        let handle = thread::Builder::new().name("rollout_flusher".into()).spawn({
            let stop = stop.clone();

            move || {
                while !stop.wait_timeout(interval) {
                    on_tick();
                }
            }
        })?;

        Ok(Flusher { stop, handle })
    }

    fn stop(self) {
        self.stop.trigger();

        // The thread only exits through the trigger, so it won't tick again after this
        let _ = self.handle.join();
    }
}

#[derive(Clone)]
struct Trigger(Arc<(Mutex<bool>, Condvar)>);

impl Trigger {
    fn new() -> Self {
        Trigger(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn trigger(&self) {
        *(self.0).0.lock().unwrap() = true;
        (self.0).1.notify_all();
    }

    fn wait_timeout(&self, mut timeout: Duration) -> bool {
        let mut triggered_slot = (self.0).0.lock().unwrap();
        loop {
            if *triggered_slot {
                return true;
            }

            if timeout == Duration::ZERO {
                return false;
            }

            let now = Instant::now();
            match (self.0).1.wait_timeout(triggered_slot, timeout).unwrap() {
                (triggered, r) if !r.timed_out() => {
                    triggered_slot = triggered;

                    // Woke up early; wait out whatever is left of the timeout
                    timeout = match timeout.checked_sub(now.elapsed()) {
                        Some(timeout) => timeout,
                        None => return *triggered_slot,
                    };
                }
                (triggered, _) => return *triggered,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct InMemorySink(Arc<Mutex<Vec<u8>>>);

    impl InMemorySink {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }

        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    impl Write for InMemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);

            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "broken"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const NEVER: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn file_buffer_write() {
        let sink = InMemorySink::default();
        let buf = FileBuffer::new(sink.clone(), 10, NEVER).unwrap();

        buf.write(b"1234567890").unwrap();
        assert_eq!(0, sink.len(), "input should be buffered");

        buf.write(b"12345").unwrap();
        assert_eq!(15, sink.len(), "a full buffer should be flushed along with the input");

        buf.write(b"abcdefghijklmno").unwrap();
        assert_eq!(30, sink.len(), "large writes go straight to the sink");
    }

    #[test]
    fn file_buffer_flush() {
        let sink = InMemorySink::default();
        let buf = FileBuffer::new(sink.clone(), 10, NEVER).unwrap();

        buf.write(b"123456789").unwrap();
        assert_eq!(9, buf.buffered());

        buf.flush().unwrap();

        assert_eq!(9, sink.len());
        assert_eq!(0, buf.buffered());
    }

    #[test]
    fn file_buffer_close() {
        let sink = InMemorySink::default();
        let buf = FileBuffer::new(sink.clone(), 10, NEVER).unwrap();

        buf.write(b"1234").unwrap();
        buf.close().unwrap();

        assert!(buf.is_closed());
        assert_eq!(b"1234", &*sink.contents());

        // Closing again is a no-op, writing fails
        buf.close().unwrap();
        buf.flush().unwrap();
        assert!(crate::is_closed(&buf.write(b"5").unwrap_err()));
    }

    #[test]
    fn file_buffer_close_reports_flush_failure() {
        let buf = FileBuffer::new(BrokenSink, 10, NEVER).unwrap();

        buf.write(b"1234").unwrap();

        assert!(buf.close().is_err());
        assert!(buf.is_closed());
    }

    #[test]
    fn file_buffer_flushes_on_interval() {
        let sink = InMemorySink::default();
        let buf = FileBuffer::new(sink.clone(), 1024, Duration::from_millis(10)).unwrap();

        buf.write(b"pending").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.len() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(b"pending", &*sink.contents());
        assert_eq!(0, buf.buffered());

        // The timer keeps running after its first tick
        buf.write(b" again").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.len() == 7 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(b"pending again", &*sink.contents());
    }

    #[test]
    fn file_buffer_stops_flushing_on_close() {
        #[derive(Clone, Default)]
        struct CountingSink(Arc<AtomicUsize>);

        impl Write for CountingSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.fetch_add(1, Ordering::SeqCst);

                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = CountingSink::default();
        let buf = FileBuffer::new(sink.clone(), 1024, Duration::from_millis(1)).unwrap();

        buf.write(b"1").unwrap();

        let start = Instant::now();
        while sink.0.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "the buffer was never flushed");

            thread::sleep(Duration::from_millis(1));
        }

        buf.close().unwrap();

        assert!(buf.flusher.lock().unwrap().is_none());

        let flushed = sink.0.load(Ordering::SeqCst);

        // Writing through the sink directly doesn't wake anything up either
        sink.clone().write(b"2").unwrap();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(flushed + 1, sink.0.load(Ordering::SeqCst));
    }

    #[test]
    fn flusher_never_ticks_after_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));

        let flusher = Flusher::spawn(Duration::from_millis(1), {
            let ticks = ticks.clone();

            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let start = Instant::now();
        while ticks.load(Ordering::SeqCst) < 3 {
            assert!(start.elapsed() < Duration::from_secs(5), "the flusher never ticked");

            thread::sleep(Duration::from_millis(1));
        }

        flusher.stop();

        let stopped_at = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(stopped_at, ticks.load(Ordering::SeqCst));
    }

    #[test]
    fn file_buffer_concurrent_writes() {
        let sink = InMemorySink::default();
        let buf = Arc::new(FileBuffer::new(sink.clone(), 64, Duration::from_millis(1)).unwrap());

        let handles = (0..8)
            .map(|_| {
                let buf = buf.clone();

                thread::spawn(move || {
                    for _ in 0..500 {
                        assert_eq!(10, buf.write(b"0123456789").unwrap());
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        buf.close().unwrap();

        let contents = sink.contents();
        assert_eq!(8 * 500 * 10, contents.len());

        // Writes never interleave within a single call
        for chunk in contents.chunks(10) {
            assert_eq!(b"0123456789", chunk);
        }
    }

    #[test]
    fn file_buffer_open_appends() {
        let dir = Path::new("./target/rollout/file_buffer_open_appends");
        let _ = fs::remove_dir_all(dir);
        fs::create_dir_all(dir).unwrap();

        let path = dir.join("test.log");

        for _ in 0..2 {
            let buf = FileBuffer::open(&path, 16, NEVER).unwrap();

            buf.write(b"line\n").unwrap();
            buf.close().unwrap();
        }

        assert_eq!("line\nline\n", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn file_buffer_open_missing_dir_fails() {
        let path = Path::new("./target/rollout/does/not/exist/test.log");
        let _ = fs::remove_dir_all("./target/rollout/does");

        assert!(FileBuffer::open(path, 16, NEVER).is_err());
    }

    #[test]
    fn trigger_wait_timeout() {
        let trigger = Trigger::new();

        assert!(!trigger.wait_timeout(Duration::from_millis(1)));

        trigger.trigger();

        assert!(trigger.wait_timeout(Duration::from_secs(1)));
        assert!(trigger.wait_timeout(Duration::ZERO));
    }
}
