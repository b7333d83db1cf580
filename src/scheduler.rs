use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

use crate::connectivity::{ConnectivitySupervisor, NetworkLink};
use crate::influx::PointWriter;
use crate::meter::{MeasurementSet, MeterReader, RegisterSource};
use crate::ota::UpdateService;
use crate::point::PointBuilder;

/// One measurement source wired up for the loop: its reader, its owned
/// measurement set, and the builder that stamps its device tag.
pub struct SamplerUnit<T> {
    reader: MeterReader<T>,
    set: MeasurementSet,
    builder: PointBuilder,
}

impl<T: RegisterSource> SamplerUnit<T> {
    pub fn new(reader: MeterReader<T>, builder: PointBuilder) -> Self {
        Self {
            reader,
            set: MeasurementSet::new(),
            builder,
        }
    }
}

/// Cooperative single-pass driver. Every tick it services the update
/// listener, repairs connectivity when the probe says it is lost, and
/// refreshes every measurement set; publishing runs on its own longer
/// interval, measured by monotonic elapsed time rather than a tick counter
/// so a slow tick delays the cadence but never skews it.
pub struct LoopScheduler<T, L, W, U> {
    units: Vec<SamplerUnit<T>>,
    supervisor: ConnectivitySupervisor<L>,
    writer: W,
    updates: U,
    tick_period: Duration,
    publish_period: Duration,
    last_publish: Instant,
}

impl<T, L, W, U> LoopScheduler<T, L, W, U>
where
    T: RegisterSource,
    L: NetworkLink,
    W: PointWriter,
    U: UpdateService,
{
    pub fn new(
        units: Vec<SamplerUnit<T>>,
        supervisor: ConnectivitySupervisor<L>,
        writer: W,
        updates: U,
        tick_period: Duration,
        publish_period: Duration,
    ) -> Self {
        Self {
            units,
            supervisor,
            writer,
            updates,
            tick_period,
            publish_period,
            last_publish: Instant::now(),
        }
    }

    /// Runs forever. Work first, then the interval wait, so the first sample
    /// happens immediately at startup.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            self.tick().await;
            ticker.tick().await;
        }
    }

    /// One pass of the loop. Public so tests can drive the schedule
    /// deterministically.
    pub async fn tick(&mut self) {
        // 1. Keep the update listener responsive.
        self.updates.service().await;

        // 2. Repair connectivity before sampling; reconnection is capped per
        //    call, so sampling still happens this tick either way.
        if self.supervisor.is_likely_lost().await {
            self.supervisor.ensure_connected().await;
        }

        // 3. Sampling cadence: every tick, every source.
        for unit in &mut self.units {
            unit.reader.refresh_all(&mut unit.set).await;
        }

        // 4. Publish cadence: elapsed time, not tick count.
        if self.last_publish.elapsed() >= self.publish_period {
            for unit in &self.units {
                let point = unit.builder.build(&unit.set);
                if let Err(e) = self.writer.publish(&point).await {
                    error!("InfluxDB write failed: {e:#}");
                }
            }
            // Advanced on failure too, so a dead store cannot cause an
            // every-tick retry storm.
            self.last_publish = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessPoint;
    use crate::point::DataPoint;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct LoggingSource {
        events: EventLog,
    }

    #[async_trait]
    impl RegisterSource for LoggingSource {
        async fn read_input_registers(
            &mut self,
            addr: u16,
            _count: u16,
        ) -> anyhow::Result<Vec<u16>> {
            if addr == 0x0000 {
                self.events.lock().unwrap().push("sample".to_string());
            }
            Ok(vec![2201, 0])
        }
    }

    struct LoggingLink {
        events: EventLog,
        signal: Arc<Mutex<Option<i32>>>,
        associates: bool,
    }

    #[async_trait]
    impl NetworkLink for LoggingLink {
        async fn associate(&mut self, _ap: &AccessPoint) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("associate".to_string());
            if self.associates {
                Ok(())
            } else {
                anyhow::bail!("unreachable")
            }
        }

        async fn signal_strength(&mut self) -> Option<i32> {
            self.events.lock().unwrap().push("probe".to_string());
            *self.signal.lock().unwrap()
        }
    }

    struct LoggingWriter {
        events: EventLog,
        fail: bool,
    }

    #[async_trait]
    impl PointWriter for LoggingWriter {
        async fn publish(&mut self, _point: &DataPoint) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("publish".to_string());
            if self.fail {
                anyhow::bail!("server rejected write")
            }
            Ok(())
        }
    }

    struct LoggingUpdates {
        events: EventLog,
    }

    #[async_trait]
    impl UpdateService for LoggingUpdates {
        async fn service(&mut self) {
            self.events.lock().unwrap().push("ota".to_string());
        }
    }

    fn candidates() -> Vec<AccessPoint> {
        vec![AccessPoint {
            ssid: "home".to_string(),
            psk: "pw".to_string(),
        }]
    }

    fn scheduler(
        events: &EventLog,
        writer_fails: bool,
        link_associates: bool,
        tick: Duration,
        publish: Duration,
    ) -> LoopScheduler<LoggingSource, LoggingLink, LoggingWriter, LoggingUpdates> {
        scheduler_with_signal(
            events,
            Arc::new(Mutex::new(Some(70))),
            writer_fails,
            link_associates,
            tick,
            publish,
        )
    }

    fn scheduler_with_signal(
        events: &EventLog,
        signal: Arc<Mutex<Option<i32>>>,
        writer_fails: bool,
        link_associates: bool,
        tick: Duration,
        publish: Duration,
    ) -> LoopScheduler<LoggingSource, LoggingLink, LoggingWriter, LoggingUpdates> {
        let units = vec![SamplerUnit::new(
            MeterReader::new(
                "node-1",
                LoggingSource {
                    events: events.clone(),
                },
            ),
            PointBuilder::new("node-1"),
        )];
        let supervisor = ConnectivitySupervisor::new(
            LoggingLink {
                events: events.clone(),
                signal,
                associates: link_associates,
            },
            candidates(),
        );
        LoopScheduler::new(
            units,
            supervisor,
            LoggingWriter {
                events: events.clone(),
                fail: writer_fails,
            },
            LoggingUpdates {
                events: events.clone(),
            },
            tick,
            publish,
        )
    }

    fn count(events: &EventLog, kind: &str) -> usize {
        events.lock().unwrap().iter().filter(|e| *e == kind).count()
    }

    #[tokio::test]
    async fn tick_services_updates_then_connectivity_then_sampling() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(
            &events,
            false,
            true,
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        sched.tick().await;

        let log = events.lock().unwrap().clone();
        // Starts disconnected: ota, associate (probe skipped), then sampling.
        assert_eq!(log, vec!["ota", "associate", "sample"]);
    }

    #[tokio::test]
    async fn sampling_still_runs_when_reconnect_fails() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(
            &events,
            false,
            false,
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        sched.tick().await;

        assert_eq!(count(&events, "sample"), 1);
        assert!(count(&events, "associate") >= 1);
    }

    #[tokio::test]
    async fn lost_signal_triggers_reconnect_before_sampling_next_tick() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let signal = Arc::new(Mutex::new(Some(70)));
        let mut sched = scheduler_with_signal(
            &events,
            signal.clone(),
            false,
            true,
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        sched.tick().await; // connects
        signal.lock().unwrap().replace(0);
        events.lock().unwrap().clear();

        sched.tick().await;

        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["ota", "probe", "associate", "sample"]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_cadence_follows_elapsed_time_not_tick_count() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let tick = Duration::from_secs(1);
        let publish = Duration::from_secs(10);
        let mut sched = scheduler(&events, false, true, tick, publish);

        // 35 simulated seconds: floor(35 / 10) publishes.
        for _ in 0..35 {
            sched.tick().await;
            tokio::time::advance(tick).await;
        }

        assert_eq!(count(&events, "publish"), 3);
        assert_eq!(count(&events, "sample"), 35);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_advances_the_schedule_like_success() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let tick = Duration::from_secs(1);
        let publish = Duration::from_secs(10);
        let mut sched = scheduler(&events, true, true, tick, publish);

        for _ in 0..35 {
            sched.tick().await;
            tokio::time::advance(tick).await;
        }

        // Failures must not cause an every-tick retry storm.
        assert_eq!(count(&events, "publish"), 3);
    }

    #[tokio::test]
    async fn update_listener_is_serviced_every_tick() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(
            &events,
            false,
            true,
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        for _ in 0..5 {
            sched.tick().await;
        }

        assert_eq!(count(&events, "ota"), 5);
    }
}
