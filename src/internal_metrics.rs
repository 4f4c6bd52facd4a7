use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

macro_rules! metrics {
    (
        $pub_container:ty {
            $field:ident: $internal_container:ident {
                $(
                    $(#[$meta:meta])*
                    $metric:ident: $ty:ident -> $pub_ty:ident,
                )*
            }
        }
    ) => {
        #[derive(Default)]
        pub(crate) struct $internal_container {
            $(
                $(#[$meta])*
                pub(crate) $metric: $ty,
            )*
        }

        impl $internal_container {
            pub fn sample(&self) -> impl Iterator<Item = emit::metric::Metric<'static, emit::empty::Empty>> + 'static {
                let $internal_container { $($metric),* } = self;

                [$(
                    emit::metric::Metric::new(
                        emit::pkg!(),
                        stringify!($metric),
                        <$ty>::AGG,
                        emit::empty::Empty,
                        $metric.sample(),
                        emit::empty::Empty,
                    ),
                )*]
                .into_iter()
            }
        }

        impl $pub_container {
            $(
                $(#[$meta])*
                pub fn $metric(&self) -> $pub_ty {
                    self.$field.$metric.sample()
                }
            )*
        }
    };
}

#[derive(Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    const AGG: &'static str = emit::well_known::METRIC_AGG_COUNT;

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

metrics!(
    RolloutMetrics {
        metrics: InternalMetrics {
            /**
            A new destination buffer was created for a rotation bucket.
            */
            buffer_create: Counter -> usize,
            /**
            Attempting to create a destination buffer failed.

            The write that triggered the rotation fails and the previous buffer, if any, stays active.
            */
            buffer_create_failed: Counter -> usize,
            /**
            A destination buffer was closed, either because it was rotated away from or the writer was closed.
            */
            buffer_close: Counter -> usize,
            /**
            Closing a destination buffer failed.

            Any bytes it was still holding may be lost.
            */
            buffer_close_failed: Counter -> usize,
            /**
            A write was rejected because the writer had been closed.
            */
            write_closed: Counter -> usize,
        }
    }
);

/**
Metrics produced by a [`crate::Rollout`].

You can enumerate the metrics using the [`emit::metric::Source`] implementation. See [`emit::metric`] for details.
*/
pub struct RolloutMetrics {
    pub(crate) metrics: Arc<InternalMetrics>,
}

impl emit::metric::Source for RolloutMetrics {
    fn sample_metrics<S: emit::metric::sampler::Sampler>(&self, sampler: S) {
        for metric in self.metrics.sample() {
            sampler.metric(metric);
        }
    }
}
