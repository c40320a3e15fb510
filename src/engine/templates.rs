use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Template fields as submitted, before time parsing and invariant checks.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDraft {
    pub park_id: Ulid,
    pub start_time: String,
    pub end_time: String,
    /// 0 = Sunday … 6 = Saturday.
    pub days_of_week: Vec<u8>,
    pub valid_from: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    pub ticket_limit: u32,
    pub price_adjustment: Money,
    pub pricing_ids: Vec<Ulid>,
}

impl TemplateDraft {
    fn build(self, id: Ulid) -> Result<TimeSlotTemplate, EngineError> {
        let start_time = TimeOfDay::parse_start(&self.start_time)?;
        let end_time = TimeOfDay::parse_end(&self.end_time)?;
        if start_time >= end_time {
            return Err(EngineError::InvalidInput(format!(
                "template must start before it ends ({start_time} >= {end_time})"
            )));
        }

        let mut days = self.days_of_week;
        if let Some(bad) = days.iter().find(|d| **d > 6) {
            return Err(EngineError::InvalidInput(format!(
                "day of week out of range: {bad}"
            )));
        }
        days.sort_unstable();
        days.dedup();
        if days.is_empty() {
            return Err(EngineError::InvalidInput("template needs at least one weekday".into()));
        }

        if let Some(until) = self.valid_until {
            if until < self.valid_from {
                return Err(EngineError::InvalidInput(format!(
                    "valid_until {until} is before valid_from {}",
                    self.valid_from
                )));
            }
        }
        if self.ticket_limit == 0 {
            return Err(EngineError::InvalidInput("ticket limit must be positive".into()));
        }
        if self.ticket_limit > MAX_TICKET_LIMIT {
            return Err(EngineError::LimitExceeded("ticket limit too large"));
        }
        if self.pricing_ids.len() > MAX_PRICING_IDS_PER_TEMPLATE {
            return Err(EngineError::LimitExceeded("too many pricing ids"));
        }

        Ok(TimeSlotTemplate {
            id,
            park_id: self.park_id,
            start_time,
            end_time,
            days_of_week: days,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            ticket_limit: self.ticket_limit,
            price_adjustment: self.price_adjustment,
            pricing_ids: self.pricing_ids,
        })
    }
}

impl Engine {
    fn check_unique(&self, template: &TimeSlotTemplate) -> Result<(), EngineError> {
        let clash = self
            .store
            .park_templates(&template.park_id)
            .into_iter()
            .find(|other| other.id != template.id && other.collides_with(template));
        match clash {
            Some(other) => Err(EngineError::AlreadyExists(other.id)),
            None => Ok(()),
        }
    }

    pub async fn create_template(
        &self,
        id: Ulid,
        draft: TemplateDraft,
    ) -> Result<TimeSlotTemplate, EngineError> {
        self.get_park(draft.park_id)?;
        let template = draft.build(id)?;

        let _guard = self.template_lock.lock().await;
        if self.store.template(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.park_template_count(&template.park_id) >= MAX_TEMPLATES_PER_PARK {
            return Err(EngineError::LimitExceeded("too many templates for park"));
        }
        self.check_unique(&template)?;

        let event = Event::TemplateCreated {
            template: template.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_event(&event);
        Ok(template)
    }

    /// Replace a template's definition. Instances already materialized keep
    /// their own limit, adjustment and pricing ids.
    pub async fn update_template(
        &self,
        id: Ulid,
        draft: TemplateDraft,
    ) -> Result<TimeSlotTemplate, EngineError> {
        let template = draft.build(id)?;

        let _guard = self.template_lock.lock().await;
        let current = self.get_template(id)?;
        if current.park_id != template.park_id {
            return Err(EngineError::InvalidInput(format!(
                "template {id} belongs to park {}",
                current.park_id
            )));
        }
        self.check_unique(&template)?;

        let event = Event::TemplateUpdated {
            template: template.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_event(&event);
        Ok(template)
    }

    /// Existing instances outlive their template and keep selling.
    pub async fn delete_template(&self, id: Ulid) -> Result<(), EngineError> {
        let _guard = self.template_lock.lock().await;
        let current = self.get_template(id)?;
        let event = Event::TemplateDeleted {
            id,
            park_id: current.park_id,
        };
        self.wal_append(&event).await?;
        self.store.apply_event(&event);
        Ok(())
    }

    pub fn get_template(&self, id: Ulid) -> Result<TimeSlotTemplate, EngineError> {
        self.store
            .template(&id)
            .ok_or(EngineError::not_found("template", id))
    }

    pub fn list_templates(&self, park_id: Ulid) -> Result<Vec<TimeSlotTemplate>, EngineError> {
        self.get_park(park_id)?;
        let mut templates = self.store.park_templates(&park_id);
        templates.sort_by_key(|t| (t.start_time, t.end_time, t.id));
        Ok(templates)
    }

    /// Templates whose validity window contains `date` and which run on its weekday.
    pub fn active_templates(
        &self,
        park_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlotTemplate>, EngineError> {
        let mut templates = self.list_templates(park_id)?;
        templates.retain(|t| t.covers(date));
        Ok(templates)
    }
}
