use crate::WorkQueue;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::{fmt, hash::Hash};

struct Instrumented<K>(WorkQueue<K>);

pub fn register<K>(reg: &mut Registry, queue: WorkQueue<K>)
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    reg.register_collector(Box::new(Instrumented(queue)));
}

impl<K> fmt::Debug for Instrumented<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Instrumented").field(&self.0).finish()
    }
}

impl<K> Collector for Instrumented<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), fmt::Error> {
        let depth = ConstGauge::new(self.0.len() as i64);
        let depth_encoder = encoder.encode_descriptor(
            "depth",
            "The number of keys waiting to be processed",
            None,
            MetricType::Gauge,
        )?;
        depth.encode(depth_encoder)?;

        let in_flight = ConstGauge::new(self.0.in_flight() as i64);
        let in_flight_encoder = encoder.encode_descriptor(
            "in_flight",
            "The number of keys being processed by workers",
            None,
            MetricType::Gauge,
        )?;
        in_flight.encode(in_flight_encoder)?;

        Ok(())
    }
}
