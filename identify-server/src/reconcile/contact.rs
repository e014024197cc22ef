//! Observation input and consolidated contact output

use identify_common::{Error, IdentityRecord, Result};
use serde::Serialize;
use std::collections::HashSet;

/// One validated (email, phone number) pair submitted for reconciliation
///
/// Empty values count as absent. Any other value, whitespace included, is
/// kept byte-for-byte; no formatting normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Build an observation, rejecting one with neither field present
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self> {
        let email = email.filter(|v| !v.is_empty());
        let phone_number = phone_number.filter(|v| !v.is_empty());

        if email.is_none() && phone_number.is_none() {
            return Err(Error::InvalidInput(
                "Provide at least email or phoneNumber".to_string(),
            ));
        }

        Ok(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Advisory lock keys covering this observation
    pub fn lock_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(email) = &self.email {
            keys.push(format!("email:{}", email));
        }
        if let Some(phone) = &self.phone_number {
            keys.push(format!("phone:{}", phone));
        }
        keys
    }

    /// True when this observation carries an email or phone number that no
    /// member of `group` has
    pub fn is_novel_for(&self, group: &[IdentityRecord]) -> bool {
        let new_email = self
            .email()
            .is_some_and(|email| !group.iter().any(|r| r.email.as_deref() == Some(email)));
        let new_phone = self.phone_number().is_some_and(|phone| {
            !group
                .iter()
                .any(|r| r.phone_number.as_deref() == Some(phone))
        });

        new_email || new_phone
    }
}

/// Consolidated view of one contact group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    pub primary_contact_id: i64,
    /// Distinct emails, primary's own first
    pub emails: Vec<String>,
    /// Distinct phone numbers, primary's own first
    pub phone_numbers: Vec<String>,
    /// Every non-primary member, in retrieval order
    pub secondary_contact_ids: Vec<i64>,
}

impl ConsolidatedContact {
    /// Build the view of `group` under `primary_id`
    ///
    /// Fails with [`Error::Invariant`] when the primary is missing from the
    /// group or any other member points somewhere else.
    pub fn from_group(primary_id: i64, group: &[IdentityRecord]) -> Result<Self> {
        let primary = group.iter().find(|r| r.id == primary_id).ok_or_else(|| {
            Error::Invariant(format!(
                "group of {} records does not contain its primary {}",
                group.len(),
                primary_id
            ))
        })?;

        if let Some(stray) = group
            .iter()
            .find(|r| r.id != primary_id && !r.is_linked_to(primary_id))
        {
            return Err(Error::Invariant(format!(
                "record {} is in the group of {} but links to {:?}",
                stray.id, primary_id, stray.linked_id
            )));
        }

        let emails = distinct_primary_first(
            primary.email.as_deref(),
            group.iter().filter_map(|r| r.email.as_deref()),
        );
        let phone_numbers = distinct_primary_first(
            primary.phone_number.as_deref(),
            group.iter().filter_map(|r| r.phone_number.as_deref()),
        );
        let secondary_contact_ids = group
            .iter()
            .filter(|r| r.id != primary_id)
            .map(|r| r.id)
            .collect();

        Ok(Self {
            primary_contact_id: primary_id,
            emails,
            phone_numbers,
            secondary_contact_ids,
        })
    }
}

fn distinct_primary_first<'a>(
    first: Option<&'a str>,
    values: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    first
        .into_iter()
        .chain(values)
        .filter(|v| seen.insert(*v))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: i64, email: Option<&str>, phone: Option<&str>, linked_id: Option<i64>) -> IdentityRecord {
        let now = Utc::now();
        IdentityRecord {
            id,
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            linked_id,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_observation_requires_a_field() {
        assert!(Observation::new(None, None).is_err());
        assert!(Observation::new(Some("".to_string()), Some("".to_string())).is_err());
        assert!(Observation::new(None, Some("555".to_string())).is_ok());
    }

    #[test]
    fn test_observation_blank_field_is_absent() {
        let obs = Observation::new(Some("a@x.com".to_string()), Some("".to_string())).unwrap();
        assert_eq!(obs.phone_number(), None);
        assert_eq!(obs.lock_keys(), vec!["email:a@x.com".to_string()]);
    }

    #[test]
    fn test_observation_whitespace_is_a_value() {
        let obs = Observation::new(Some(" ".to_string()), None).unwrap();
        assert_eq!(obs.email(), Some(" "));
        assert_eq!(obs.lock_keys(), vec!["email: ".to_string()]);

        let padded = Observation::new(None, Some(" 555 ".to_string())).unwrap();
        assert_eq!(padded.phone_number(), Some(" 555 "));
    }

    #[test]
    fn test_novelty() {
        let group = vec![record(1, Some("a@x.com"), Some("555"), None)];

        let same = Observation::new(Some("a@x.com".to_string()), Some("555".to_string())).unwrap();
        let email_only = Observation::new(Some("a@x.com".to_string()), None).unwrap();
        let new_phone = Observation::new(Some("a@x.com".to_string()), Some("777".to_string())).unwrap();

        assert!(!same.is_novel_for(&group));
        assert!(!email_only.is_novel_for(&group));
        assert!(new_phone.is_novel_for(&group));
    }

    #[test]
    fn test_primary_values_first_and_distinct() {
        let group = vec![
            record(3, Some("b@x.com"), Some("111"), Some(5)),
            record(5, Some("a@x.com"), Some("222"), None),
            record(8, Some("b@x.com"), Some("222"), Some(5)),
            record(9, None, Some("333"), Some(5)),
        ];

        let contact = ConsolidatedContact::from_group(5, &group).unwrap();

        assert_eq!(contact.primary_contact_id, 5);
        assert_eq!(contact.emails, vec!["a@x.com", "b@x.com"]);
        assert_eq!(contact.phone_numbers, vec!["222", "111", "333"]);
        assert_eq!(contact.secondary_contact_ids, vec![3, 8, 9]);
    }

    #[test]
    fn test_primary_without_email_keeps_encounter_order() {
        let group = vec![
            record(1, None, Some("555"), None),
            record(2, Some("z@x.com"), None, Some(1)),
            record(3, Some("a@x.com"), None, Some(1)),
        ];

        let contact = ConsolidatedContact::from_group(1, &group).unwrap();
        assert_eq!(contact.emails, vec!["z@x.com", "a@x.com"]);
    }

    #[test]
    fn test_missing_primary_is_invariant_violation() {
        let group = vec![record(2, Some("a@x.com"), None, Some(1))];
        let err = ConsolidatedContact::from_group(1, &group).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn test_stray_member_is_invariant_violation() {
        let group = vec![
            record(1, Some("a@x.com"), None, None),
            record(2, Some("b@x.com"), None, Some(7)),
        ];
        let err = ConsolidatedContact::from_group(1, &group).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn test_serializes_camel_case() {
        let contact = ConsolidatedContact {
            primary_contact_id: 1,
            emails: vec!["a@x.com".to_string()],
            phone_numbers: vec![],
            secondary_contact_ids: vec![],
        };

        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["primaryContactId"], 1);
        assert!(json["phoneNumbers"].as_array().unwrap().is_empty());
        assert!(json["secondaryContactIds"].is_array());
    }
}
