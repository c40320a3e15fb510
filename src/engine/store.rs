use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedInstance = Arc<RwLock<SlotInstance>>;
pub type SharedLine = Arc<Mutex<CartLine>>;

type DayKey = (Ulid, NaiveDate);

/// Indexed in-memory state rebuilt from the WAL.
///
/// Instance rows and cart lines sit behind their own locks; the maps only
/// hand out `Arc`s, so no map guard is ever held across an await.
pub struct SlotStore {
    parks: DashMap<Ulid, ParkProfile>,
    templates: DashMap<Ulid, TimeSlotTemplate>,
    park_templates: DashMap<Ulid, Vec<Ulid>>,
    instances: DashMap<Ulid, SharedInstance>,
    /// (park, date) → instance ids
    day_index: DashMap<DayKey, Vec<Ulid>>,
    /// Unique instance identities. A second claim on a key is refused.
    identities: DashMap<InstanceKey, Ulid>,
    day_locks: DashMap<DayKey, Arc<Mutex<()>>>,
    lines: DashMap<Ulid, SharedLine>,
    /// Line ids with an add in flight.
    line_claims: DashMap<Ulid, ()>,
    /// cart → line ids
    cart_index: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            parks: DashMap::new(),
            templates: DashMap::new(),
            park_templates: DashMap::new(),
            instances: DashMap::new(),
            day_index: DashMap::new(),
            identities: DashMap::new(),
            day_locks: DashMap::new(),
            lines: DashMap::new(),
            line_claims: DashMap::new(),
            cart_index: DashMap::new(),
        }
    }

    /// Rebuild a store from a sequence of events.
    pub fn fold(events: &[Event]) -> Self {
        let store = Self::new();
        for event in events {
            store.apply_event(event);
        }
        store
    }

    // ── Parks ────────────────────────────────────────────────

    pub fn park(&self, id: &Ulid) -> Option<ParkProfile> {
        self.parks.get(id).map(|e| e.value().clone())
    }

    pub fn parks(&self) -> Vec<ParkProfile> {
        self.parks.iter().map(|e| e.value().clone()).collect()
    }

    pub fn park_count(&self) -> usize {
        self.parks.len()
    }

    // ── Templates ────────────────────────────────────────────

    pub fn template(&self, id: &Ulid) -> Option<TimeSlotTemplate> {
        self.templates.get(id).map(|e| e.value().clone())
    }

    pub fn park_templates(&self, park_id: &Ulid) -> Vec<TimeSlotTemplate> {
        let ids = self
            .park_templates
            .get(park_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.template(id)).collect()
    }

    pub fn park_template_count(&self, park_id: &Ulid) -> usize {
        self.park_templates.get(park_id).map_or(0, |e| e.len())
    }

    fn put_template(&self, template: TimeSlotTemplate) {
        let (id, park_id) = (template.id, template.park_id);
        if self.templates.insert(id, template).is_none() {
            self.park_templates.entry(park_id).or_default().push(id);
        }
    }

    fn remove_template(&self, id: &Ulid, park_id: &Ulid) {
        self.templates.remove(id);
        if let Some(mut ids) = self.park_templates.get_mut(park_id) {
            ids.retain(|t| t != id);
        }
    }

    // ── Instances ────────────────────────────────────────────

    pub fn instance(&self, id: &Ulid) -> Option<SharedInstance> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    pub fn day_instances(&self, park_id: Ulid, date: NaiveDate) -> Vec<SharedInstance> {
        let ids = self
            .day_index
            .get(&(park_id, date))
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.instance(id)).collect()
    }

    pub fn day_instance_count(&self, park_id: Ulid, date: NaiveDate) -> usize {
        self.day_index.get(&(park_id, date)).map_or(0, |e| e.len())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Serializes materialization of one park-day.
    pub fn day_lock(&self, park_id: Ulid, date: NaiveDate) -> Arc<Mutex<()>> {
        self.day_locks.entry((park_id, date)).or_default().clone()
    }

    /// Drop locks of park-days before `cutoff` that nobody is holding.
    pub fn evict_day_locks(&self, cutoff: NaiveDate) -> usize {
        let before = self.day_locks.len();
        self.day_locks
            .retain(|(_, date), lock| *date >= cutoff || Arc::strong_count(lock) > 1);
        before - self.day_locks.len()
    }

    pub fn day_lock_count(&self) -> usize {
        self.day_locks.len()
    }

    /// Reserve an identity for `id`. Returns the current owner if already taken.
    pub fn claim_identity(&self, key: InstanceKey, id: Ulid) -> Result<(), Ulid> {
        match self.identities.entry(key) {
            Entry::Occupied(e) => Err(*e.get()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    /// Drop a claim that never made it to the WAL.
    pub fn release_identity(&self, key: &InstanceKey, id: Ulid) {
        self.identities.remove_if(key, |_, owner| *owner == id);
    }

    pub fn identity_owner(&self, key: &InstanceKey) -> Option<Ulid> {
        self.identities.get(key).map(|e| *e.value())
    }

    fn insert_instance(&self, instance: SlotInstance) {
        let id = instance.id;
        self.identities.insert(instance.identity(), id);
        let mut day = self
            .day_index
            .entry((instance.park_id, instance.date))
            .or_default();
        if !day.contains(&id) {
            day.push(id);
        }
        drop(day);
        self.instances.insert(id, Arc::new(RwLock::new(instance)));
    }

    // ── Cart lines ───────────────────────────────────────────

    pub fn line(&self, id: &Ulid) -> Option<SharedLine> {
        self.lines.get(id).map(|e| e.value().clone())
    }

    pub fn contains_line(&self, id: &Ulid) -> bool {
        self.lines.contains_key(id)
    }

    pub fn cart_lines(&self, cart_id: &Ulid) -> Vec<SharedLine> {
        let ids = self
            .cart_index
            .get(cart_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.line(id)).collect()
    }

    pub fn cart_line_count(&self, cart_id: &Ulid) -> usize {
        self.cart_index.get(cart_id).map_or(0, |e| e.len())
    }

    pub fn line_rows(&self) -> Vec<SharedLine> {
        self.lines.iter().map(|e| e.value().clone()).collect()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Exclusive right to create line `id`, held until the returned claim
    /// drops. `None` if the line exists or another add holds the claim.
    pub fn claim_line(&self, id: Ulid) -> Option<LineClaim<'_>> {
        match self.line_claims.entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(e) => {
                e.insert(());
            }
        }
        let claim = LineClaim { store: self, id };
        if self.lines.contains_key(&id) {
            return None;
        }
        Some(claim)
    }

    /// Insert a new line. An id already present is left untouched and
    /// `false` is returned.
    pub fn insert_line(&self, line: CartLine) -> bool {
        let (id, cart_id) = (line.id, line.cart_id);
        match self.lines.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(e) => {
                e.insert(Arc::new(Mutex::new(line)));
            }
        }
        self.cart_index.entry(cart_id).or_default().push(id);
        true
    }

    fn remove_line(&self, id: &Ulid, cart_id: &Ulid) {
        self.lines.remove(id);
        let emptied = match self.cart_index.get_mut(cart_id) {
            Some(mut ids) => {
                ids.retain(|l| l != id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.cart_index.remove_if(cart_id, |_, ids| ids.is_empty());
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event without any outside lock held. Used for replay and for
    /// events that touch no instance row or line (parks, templates, inserts).
    /// Rows are only reachable through this store, so during replay the
    /// `try_*` locks are uncontended.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::ParkSaved { park } => {
                self.parks.insert(park.id, park.clone());
            }
            Event::TemplateCreated { template } | Event::TemplateUpdated { template } => {
                self.put_template(template.clone());
            }
            Event::TemplateDeleted { id, park_id } => self.remove_template(id, park_id),
            Event::InstanceCreated { instance } => self.insert_instance(instance.clone()),
            Event::LineHeld { line } => {
                // A line id holds tickets once; a repeated hold is ignored whole.
                if self.contains_line(&line.id) {
                    return;
                }
                if let Some(row) = self.instance(&line.instance_id) {
                    if let Ok(mut guard) = row.try_write() {
                        apply_to_instance(&mut guard, event);
                    }
                }
                self.insert_line(line.clone());
            }
            Event::LineRestored { line } => {
                self.insert_line(line.clone());
            }
            Event::LinePurged { id, cart_id } => self.remove_line(id, cart_id),
            _ => {
                if let Some(instance_id) = event_instance_id(event) {
                    if let Some(row) = self.instance(&instance_id) {
                        if let Ok(mut guard) = row.try_write() {
                            apply_to_instance(&mut guard, event);
                        }
                    }
                }
                if let Some(line_id) = event_line_id(event) {
                    if let Some(line) = self.line(&line_id) {
                        if let Ok(mut guard) = line.try_lock() {
                            apply_to_line(&mut guard, event);
                        }
                    }
                }
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for park in self.parks() {
            events.push(Event::ParkSaved { park });
        }
        for entry in self.templates.iter() {
            events.push(Event::TemplateCreated {
                template: entry.value().clone(),
            });
        }
        let rows: Vec<SharedInstance> = self.instances.iter().map(|e| e.value().clone()).collect();
        for row in rows {
            if let Ok(guard) = row.try_read() {
                events.push(Event::InstanceCreated {
                    instance: guard.clone(),
                });
            }
        }
        for line in self.line_rows() {
            if let Ok(guard) = line.try_lock() {
                events.push(Event::LineRestored { line: guard.clone() });
            }
        }
        events
    }
}

/// Held while a line is being created. Dropping it frees the id again; by
/// then either the line is in the store or the add failed.
pub struct LineClaim<'a> {
    store: &'a SlotStore,
    id: Ulid,
}

impl Drop for LineClaim<'_> {
    fn drop(&mut self) {
        self.store.line_claims.remove(&self.id);
    }
}

fn take(instance: &mut SlotInstance, quantity: u32) {
    instance.available_tickets = instance.available_tickets.saturating_sub(quantity);
}

/// Release never pushes the counter past the instance's limit.
fn give(instance: &mut SlotInstance, quantity: u32) {
    instance.available_tickets = instance
        .available_tickets
        .saturating_add(quantity)
        .min(instance.ticket_limit);
}

/// Counter effect of an event on its instance row (caller holds the row lock).
pub(crate) fn apply_to_instance(instance: &mut SlotInstance, event: &Event) {
    match event {
        Event::TicketsReserved { quantity, .. } => take(instance, *quantity),
        Event::LineHeld { line } => take(instance, line.quantity),
        Event::TicketsReleased { quantity, .. }
        | Event::LineReleased { quantity, .. }
        | Event::LineCancelled { quantity, .. } => give(instance, *quantity),
        Event::LineResized { from, to, .. } => {
            if to > from {
                take(instance, to - from);
            } else {
                give(instance, from - to);
            }
        }
        _ => {}
    }
}

/// State effect of an event on a cart line (caller holds the line lock).
pub(crate) fn apply_to_line(line: &mut CartLine, event: &Event) {
    match event {
        Event::LineResized { to, at, .. } => {
            line.quantity = *to;
            line.updated_at = *at;
        }
        Event::LineReleased { at, .. } => {
            line.status = LineStatus::Released;
            line.updated_at = *at;
        }
        Event::LineConfirmed { at, .. } => {
            line.status = LineStatus::Confirmed;
            line.updated_at = *at;
        }
        Event::LineCancelled { at, .. } => {
            line.status = LineStatus::Cancelled;
            line.updated_at = *at;
        }
        Event::LineUsed { at, .. } => {
            line.used = true;
            line.updated_at = *at;
        }
        _ => {}
    }
}

fn event_instance_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TicketsReserved { instance_id, .. }
        | Event::TicketsReleased { instance_id, .. }
        | Event::LineResized { instance_id, .. }
        | Event::LineReleased { instance_id, .. }
        | Event::LineCancelled { instance_id, .. } => Some(*instance_id),
        Event::LineHeld { line } => Some(line.instance_id),
        _ => None,
    }
}

fn event_line_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::LineResized { id, .. }
        | Event::LineReleased { id, .. }
        | Event::LineConfirmed { id, .. }
        | Event::LineCancelled { id, .. }
        | Event::LineUsed { id, .. } => Some(*id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(limit: u32) -> SlotInstance {
        SlotInstance {
            id: Ulid::new(),
            park_id: Ulid::new(),
            date: parse_date("2026-10-17").unwrap(),
            source: SlotSource::AutoFill,
            start: TimeOfDay::parse_start("09:00").unwrap(),
            end: TimeOfDay::parse_end("11:00").unwrap(),
            ticket_limit: limit,
            available_tickets: limit,
            price_adjustment: 0,
            pricing_ids: vec![],
            created_at: 0,
        }
    }

    #[test]
    fn release_is_clamped_to_limit() {
        let mut inst = instance(10);
        let id = inst.id;
        apply_to_instance(&mut inst, &Event::TicketsReserved { instance_id: id, quantity: 4 });
        assert_eq!(inst.available_tickets, 6);
        apply_to_instance(&mut inst, &Event::TicketsReleased { instance_id: id, quantity: 4 });
        assert_eq!(inst.available_tickets, 10);
        // A second release must not push past the limit.
        apply_to_instance(&mut inst, &Event::TicketsReleased { instance_id: id, quantity: 4 });
        assert_eq!(inst.available_tickets, 10);
    }

    #[test]
    fn resize_moves_counter_by_delta() {
        let mut inst = instance(10);
        let id = inst.id;
        let line_id = Ulid::new();
        apply_to_instance(&mut inst, &Event::TicketsReserved { instance_id: id, quantity: 2 });
        apply_to_instance(
            &mut inst,
            &Event::LineResized { id: line_id, instance_id: id, from: 2, to: 5, at: 0 },
        );
        assert_eq!(inst.available_tickets, 5);
        apply_to_instance(
            &mut inst,
            &Event::LineResized { id: line_id, instance_id: id, from: 5, to: 1, at: 0 },
        );
        assert_eq!(inst.available_tickets, 9);
    }

    #[test]
    fn duplicate_identity_refused() {
        let store = SlotStore::new();
        let inst = instance(20);
        let key = inst.identity();
        assert!(store.claim_identity(key, inst.id).is_ok());
        let other = Ulid::new();
        assert_eq!(store.claim_identity(key, other), Err(inst.id));

        // Only the owner's claim can be dropped.
        store.release_identity(&key, other);
        assert_eq!(store.identity_owner(&key), Some(inst.id));
        store.release_identity(&key, inst.id);
        assert_eq!(store.identity_owner(&key), None);
    }

    #[test]
    fn fold_rebuilds_counters_and_lines() {
        let inst = instance(20);
        let line = CartLine {
            id: Ulid::new(),
            cart_id: Ulid::new(),
            instance_id: inst.id,
            pricing_id: Ulid::new(),
            quantity: 3,
            unit_price: 1000,
            status: LineStatus::Held,
            used: false,
            created_at: 1,
            updated_at: 1,
            expires_at: 100,
        };
        let events = vec![
            Event::InstanceCreated { instance: inst.clone() },
            Event::LineHeld { line: line.clone() },
            Event::TicketsReserved { instance_id: inst.id, quantity: 5 },
            Event::LineConfirmed { id: line.id, at: 2 },
        ];
        let store = SlotStore::fold(&events);

        let row = store.instance(&inst.id).unwrap();
        assert_eq!(row.try_read().unwrap().available_tickets, 12);
        let held = store.line(&line.id).unwrap();
        assert_eq!(held.try_lock().unwrap().status, LineStatus::Confirmed);
        assert_eq!(store.cart_line_count(&line.cart_id), 1);
        assert_eq!(store.day_instance_count(inst.park_id, inst.date), 1);
    }

    #[test]
    fn snapshot_round_trips_state() {
        let inst = instance(8);
        let line = CartLine {
            id: Ulid::new(),
            cart_id: Ulid::new(),
            instance_id: inst.id,
            pricing_id: Ulid::new(),
            quantity: 2,
            unit_price: 500,
            status: LineStatus::Held,
            used: false,
            created_at: 1,
            updated_at: 1,
            expires_at: 100,
        };
        let store = SlotStore::fold(&[
            Event::InstanceCreated { instance: inst.clone() },
            Event::LineHeld { line: line.clone() },
        ]);

        let rebuilt = SlotStore::fold(&store.snapshot_events());
        let row = rebuilt.instance(&inst.id).unwrap();
        // The snapshot must not re-apply the hold.
        assert_eq!(row.try_read().unwrap().available_tickets, 6);
        assert!(rebuilt.contains_line(&line.id));
    }

    fn held_line(instance_id: Ulid, quantity: u32) -> CartLine {
        CartLine {
            id: Ulid::new(),
            cart_id: Ulid::new(),
            instance_id,
            pricing_id: Ulid::new(),
            quantity,
            unit_price: 500,
            status: LineStatus::Held,
            used: false,
            created_at: 1,
            updated_at: 1,
            expires_at: 100,
        }
    }

    #[test]
    fn line_claim_is_exclusive_until_dropped() {
        let store = SlotStore::new();
        let id = Ulid::new();
        let claim = store.claim_line(id);
        assert!(claim.is_some());
        assert!(store.claim_line(id).is_none());
        drop(claim);
        assert!(store.claim_line(id).is_some());

        // An existing line can't be claimed at all.
        let line = held_line(Ulid::new(), 1);
        assert!(store.insert_line(line.clone()));
        assert!(store.claim_line(line.id).is_none());
    }

    #[test]
    fn insert_line_keeps_the_first_line() {
        let store = SlotStore::new();
        let first = held_line(Ulid::new(), 2);
        let mut second = first.clone();
        second.quantity = 7;
        assert!(store.insert_line(first.clone()));
        assert!(!store.insert_line(second));
        let row = store.line(&first.id).unwrap();
        assert_eq!(row.try_lock().unwrap().quantity, 2);
        assert_eq!(store.cart_line_count(&first.cart_id), 1);
    }

    #[test]
    fn repeated_hold_takes_tickets_once() {
        let inst = instance(10);
        let line = held_line(inst.id, 3);
        let store = SlotStore::fold(&[
            Event::InstanceCreated { instance: inst.clone() },
            Event::LineHeld { line: line.clone() },
            Event::LineHeld { line: line.clone() },
        ]);
        let row = store.instance(&inst.id).unwrap();
        assert_eq!(row.try_read().unwrap().available_tickets, 7);
        assert_eq!(store.cart_line_count(&line.cart_id), 1);
    }

    #[test]
    fn purge_drops_line_and_cart_entry() {
        let inst = instance(10);
        let line = held_line(inst.id, 3);
        let store = SlotStore::fold(&[
            Event::InstanceCreated { instance: inst.clone() },
            Event::LineHeld { line: line.clone() },
            Event::LineCancelled { id: line.id, instance_id: inst.id, quantity: 3, at: 5 },
            Event::LinePurged { id: line.id, cart_id: line.cart_id },
        ]);
        assert!(!store.contains_line(&line.id));
        assert_eq!(store.cart_line_count(&line.cart_id), 0);
        assert_eq!(store.line_count(), 0);
        // The counter is untouched by the purge itself.
        let row = store.instance(&inst.id).unwrap();
        assert_eq!(row.try_read().unwrap().available_tickets, 10);
    }

    #[test]
    fn evicts_only_idle_past_day_locks() {
        let store = SlotStore::new();
        let park = Ulid::new();
        let old = parse_date("2026-10-10").unwrap();
        let busy = parse_date("2026-10-11").unwrap();
        let today = parse_date("2026-10-17").unwrap();
        drop(store.day_lock(park, old));
        let held = store.day_lock(park, busy);
        drop(store.day_lock(park, today));

        assert_eq!(store.evict_day_locks(today), 1);
        assert_eq!(store.day_lock_count(), 2);
        drop(held);
        assert_eq!(store.evict_day_locks(today), 1);
        assert_eq!(store.day_lock_count(), 1);
    }
}
