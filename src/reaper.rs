use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::{now_ms, Engine};

/// Sweep expired cart holds back into their instances every `every`, then
/// drop lines that settled longer ago than the retention window.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = now_ms();
        let released = engine.expire_holds(now).await;
        if released == 0 {
            debug!("no expired holds");
        }
        engine.purge_settled_lines(now).await;
    }
}

/// Compact the WAL whenever `threshold` appends have piled up since the last snapshot.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::TemplateDraft;
    use crate::model::*;
    use crate::pricing::PriceTable;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkslot_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_releases_lapsed_holds() {
        let config = EngineConfig {
            hold_ttl_ms: 0,
            ..EngineConfig::default()
        };
        let prices = Arc::new(PriceTable::new());
        let engine = Arc::new(
            Engine::new(test_wal_path("reaper_sweep.wal"), config, prices.clone()).unwrap(),
        );

        let park = Ulid::new();
        engine
            .save_park(ParkProfile {
                id: park,
                name: "Zipline".into(),
                schedule: ParkSchedule::with_default_hours("09:00", "18:00"),
            })
            .await
            .unwrap();
        engine
            .create_template(
                Ulid::new(),
                TemplateDraft {
                    park_id: park,
                    start_time: "09:00".into(),
                    end_time: "10:00".into(),
                    days_of_week: vec![0, 1, 2, 3, 4, 5, 6],
                    valid_from: parse_date("2026-01-01").unwrap(),
                    valid_until: None,
                    ticket_limit: 6,
                    price_adjustment: 0,
                    pricing_ids: vec![],
                },
            )
            .await
            .unwrap();
        let slot = engine
            .materialize_for_date(park, parse_date("2026-10-20").unwrap())
            .await
            .unwrap()
            .remove(0);

        let pricing = Ulid::new();
        prices.set(pricing, 1500);
        let line = engine
            .add_line(Ulid::new(), Ulid::new(), slot.id, pricing, 6)
            .await
            .unwrap();
        assert_eq!(engine.query(slot.id).await.unwrap().available_tickets, 0);

        let sweeper = tokio::spawn(run_reaper(engine.clone(), Duration::from_secs(5)));
        // The first tick fires immediately; yield until the sweep has run.
        for _ in 0..50 {
            if engine.get_line(line.id).await.unwrap().status == LineStatus::Released {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();

        assert_eq!(engine.get_line(line.id).await.unwrap().status, LineStatus::Released);
        assert_eq!(engine.query(slot.id).await.unwrap().available_tickets, 6);
    }
}
