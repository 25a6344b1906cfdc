// Background eviction of expired external payload parts.
//
// Runs on its own worker with its own database connection. Each pass walks
// all collections, expires stale payload parts under the collection's
// effective cache policy and re-tunes the sleep interval from the amount
// of work it found.

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::PAYLOAD_PART_PREFIX;
use crate::storage::datastore::DataStore;
use crate::storage::db::Value;
use crate::storage::entities::{Collection, Part, PimItem};
use crate::storage::part_helper::PartHelper;
use crate::storage::query_builder::{CompareOperator, Condition, JoinType};

/// Lower and upper bounds of the sleep interval, in seconds.
const MIN_INTERVAL: i64 = 60;
const MAX_INTERVAL: i64 = 600;

pub struct CacheCleaner {
    store: DataStore,
    part_helper: PartHelper,
    /// Seconds until the next pass.
    interval: i64,
    /// Moving average of collections that had expired parts.
    loops: i64,
}

impl CacheCleaner {
    pub fn new(store: DataStore, part_helper: PartHelper) -> Self {
        Self {
            store,
            part_helper,
            interval: MIN_INTERVAL,
            loops: 0,
        }
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// Worker loop; terminates when the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("cache cleaner started");
        loop {
            let sleep = tokio::time::sleep(std::time::Duration::from_secs(self.interval as u64));
            tokio::select! {
                _ = sleep => {}
                _ = shutdown.changed() => {
                    info!("cache cleaner stopping");
                    return;
                }
            }
            match self.clean_cache() {
                Ok(expired) => {
                    debug!(collections = expired, next_pass = self.interval, "cache pass done")
                }
                Err(e) => warn!(error = %e, "cache pass failed"),
            }
        }
    }

    /// One full pass over all collections. Returns how many collections had
    /// expired parts.
    pub fn clean_cache(&mut self) -> Result<i64> {
        let mut loops_with_expired_item: i64 = 0;

        for collection in Collection::retrieve_all(self.store.db())? {
            // determine the active cache policy
            let policy = self.store.active_cache_policy(&collection)?;

            // check if there is something to expire at all
            if policy.local_parts.iter().any(|p| p == "ALL")
                || policy.cache_timeout < 0
                || !collection.enabled
                || collection.is_virtual
            {
                continue;
            }
            let expire_time = i64::from(policy.cache_timeout.max(5));

            // find all expired item parts
            let mut qb = Part::select();
            let mut join = Condition::default();
            join.add_column_condition(
                Part::full("pimItemId"),
                CompareOperator::Equals,
                PimItem::full("id"),
            );
            qb.add_join(JoinType::InnerJoin, PimItem::TABLE, join);
            qb.add_value_condition(
                PimItem::full("collectionId"),
                CompareOperator::Equals,
                collection.id,
            );
            qb.add_value_condition(
                PimItem::full("atime"),
                CompareOperator::Less,
                Utc::now() - Duration::minutes(expire_time),
            );
            qb.add_value_condition(Part::full("data"), CompareOperator::IsNot, Value::Null);
            qb.add_value_condition(Part::full("external"), CompareOperator::Equals, true);
            qb.add_value_condition(
                format!("substr( {}, 1, 4 )", Part::full("name")),
                CompareOperator::Equals,
                PAYLOAD_PART_PREFIX,
            );
            qb.add_value_condition(PimItem::full("dirty"), CompareOperator::Equals, false);
            if !policy.local_parts.is_empty() {
                let local_parts: Vec<Value> = policy
                    .local_parts
                    .iter()
                    .map(|name| {
                        if name.starts_with(PAYLOAD_PART_PREFIX) {
                            Value::from(name.as_str())
                        } else {
                            Value::from(format!("{PAYLOAD_PART_PREFIX}{name}"))
                        }
                    })
                    .collect();
                qb.add_value_list_condition(
                    Part::full("name"),
                    CompareOperator::NotIn,
                    local_parts,
                );
            }

            let rows = match qb.query(self.store.db()) {
                Ok(rows) => rows,
                Err(_) => continue,
            };
            if rows.is_empty() {
                continue;
            }
            debug!(
                parts = rows.len(),
                collection = %collection.name,
                "expiring item parts"
            );

            // clear the data field
            for row in &rows {
                let mut part = Part {
                    id: row[0].as_i64(),
                    pim_item_id: row[1].as_i64(),
                    name: row[2].as_string(),
                    data: row[3].as_opt_string().map(String::into_bytes),
                    datasize: row[4].as_i64(),
                    version: row[5].as_i64() as i32,
                    external: row[6].as_bool(),
                };
                if let Err(e) = self.part_helper.truncate(self.store.db(), &mut part) {
                    debug!(part = part.id, error = %e, "failed to expire item part");
                }
            }
            loops_with_expired_item += 1;
        }

        self.retune(loops_with_expired_item);
        Ok(loops_with_expired_item)
    }

    /// Interval feedback. The `< 50` term is a tuning heuristic inherited
    /// from long-observed behavior; keep it as-is.
    fn retune(&mut self, loops_with_expired_item: i64) {
        if self.loops < loops_with_expired_item {
            if self.interval > MIN_INTERVAL && loops_with_expired_item - self.loops < 50 {
                self.interval -= 60;
            } else {
                self.interval = MIN_INTERVAL;
            }
        } else if self.interval < MAX_INTERVAL {
            self.interval += 60;
        }

        self.loops = (loops_with_expired_item + self.loops) >> 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::Database;
    use crate::storage::entities::{MimeType, Resource};
    use crate::storage::schema::DbInitializer;
    use tempfile::TempDir;

    fn setup(cache_timeout: i32, local_parts: Option<&str>) -> (CacheCleaner, i64, TempDir) {
        let db = Database::open_in_memory().unwrap();
        DbInitializer::new(&db).run().unwrap();

        let mut resource = Resource {
            name: "res".into(),
            ..Default::default()
        };
        resource.insert(&db).unwrap();
        let mut collection = Collection::new("c", resource.id);
        collection.cache_policy_inherit = false;
        collection.cache_policy_cache_timeout = cache_timeout;
        collection.cache_policy_local_parts = local_parts.map(String::from);
        collection.insert(&db).unwrap();

        let mime = MimeType::retrieve_or_insert(&db, "message/rfc822").unwrap();
        let mut item = PimItem {
            collection_id: collection.id,
            mime_type_id: mime.id,
            atime: Some(Utc::now() - Duration::minutes(10)),
            datetime: Some(Utc::now() - Duration::minutes(10)),
            ..Default::default()
        };
        item.insert(&db).unwrap();

        let dir = TempDir::new().unwrap();
        let helper = PartHelper::new(dir.path().join("file_db_data"), 64);
        let mut part = Part {
            pim_item_id: item.id,
            name: "PLD:RFC822".into(),
            ..Default::default()
        };
        helper.insert(&db, &mut part, &vec![0u8; 512]).unwrap();
        assert!(part.external);

        let part_id = part.id;
        let store = DataStore::without_bus(db);
        (CacheCleaner::new(store, helper), part_id, dir)
    }

    #[test]
    fn expired_external_payload_is_truncated() {
        let (mut cleaner, part_id, _dir) = setup(5, None);
        let expired = cleaner.clean_cache().unwrap();
        assert_eq!(expired, 1);

        let part = Part::retrieve_by_id(cleaner.store.db(), part_id).unwrap().unwrap();
        assert!(!part.external);
        assert_eq!(part.datasize, 0);
        assert!(part.data.is_none());
        assert!(std::fs::read_dir(cleaner.part_helper.data_dir())
            .unwrap()
            .next()
            .is_none());

        // second pass is a no-op
        assert_eq!(cleaner.clean_cache().unwrap(), 0);
    }

    #[test]
    fn negative_timeout_never_evicts() {
        let (mut cleaner, part_id, _dir) = setup(-1, None);
        assert_eq!(cleaner.clean_cache().unwrap(), 0);
        assert!(Part::retrieve_by_id(cleaner.store.db(), part_id).unwrap().unwrap().external);
    }

    #[test]
    fn local_parts_all_never_evicts() {
        let (mut cleaner, part_id, _dir) = setup(5, Some("ALL"));
        assert_eq!(cleaner.clean_cache().unwrap(), 0);
        assert!(Part::retrieve_by_id(cleaner.store.db(), part_id).unwrap().unwrap().external);
    }

    #[test]
    fn declared_local_parts_are_kept() {
        let (mut cleaner, part_id, _dir) = setup(5, Some("RFC822"));
        assert_eq!(cleaner.clean_cache().unwrap(), 0);
        assert!(Part::retrieve_by_id(cleaner.store.db(), part_id).unwrap().unwrap().external);
    }

    #[test]
    fn dirty_items_are_not_evicted() {
        let (mut cleaner, part_id, _dir) = setup(5, None);
        let part = Part::retrieve_by_id(cleaner.store.db(), part_id).unwrap().unwrap();
        let mut item = PimItem::retrieve_by_id(cleaner.store.db(), part.pim_item_id)
            .unwrap()
            .unwrap();
        item.dirty = true;
        item.update(cleaner.store.db()).unwrap();
        assert_eq!(cleaner.clean_cache().unwrap(), 0);
    }

    #[test]
    fn interval_retuning_follows_the_formula() {
        let (mut cleaner, _, _dir) = setup(-1, None);

        // no work: interval grows toward the cap
        cleaner.interval = 540;
        cleaner.loops = 0;
        cleaner.retune(0);
        assert_eq!(cleaner.interval, 600);
        cleaner.retune(0);
        assert_eq!(cleaner.interval, 600);

        // a little work at a raised interval: back off by one step
        cleaner.loops = 0;
        cleaner.retune(10);
        assert_eq!(cleaner.interval, 540);
        assert_eq!(cleaner.loops, 2);

        // a burst of work: snap to the minimum
        cleaner.retune(60);
        assert_eq!(cleaner.interval, 60);
        assert_eq!(cleaner.loops, (60 + 2) >> 2);

        // at the minimum already, more work keeps it there
        cleaner.loops = 0;
        cleaner.retune(5);
        assert_eq!(cleaner.interval, 60);
    }
}
