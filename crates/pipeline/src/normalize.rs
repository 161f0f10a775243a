//! Converts raw platform events into [`NormalizedRecord`]s.
//!
//! Pure and deterministic: a missing or blank required field yields a
//! [`ParseError`], never a partially populated record.

use chrono::{DateTime, TimeZone, Utc};

use crate::record::{MailMessage, NormalizedRecord, RawEvent, SmsPayload, Source};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("timestamp out of range: {0}ms")]
    InvalidTimestamp(i64),
}

pub fn normalize(raw: &RawEvent) -> Result<NormalizedRecord, ParseError> {
    match raw {
        RawEvent::Sms(sms) => normalize_sms(sms),
        RawEvent::Mail(mail) => normalize_mail(mail),
    }
}

fn normalize_sms(sms: &SmsPayload) -> Result<NormalizedRecord, ParseError> {
    let sender = required(sms.sender.as_deref(), "sender")?;
    let body = sms.parts.concat();
    if body.trim().is_empty() {
        return Err(ParseError::MissingField("body"));
    }
    let received_at = timestamp(sms.timestamp_ms, "timestamp_ms")?;

    let mut record = NormalizedRecord::new(Source::Sms, received_at, sender, body);
    if let Some(id) = present(sms.message_id.as_deref()) {
        record = record.with_platform_id(id);
    }
    Ok(record)
}

fn normalize_mail(mail: &MailMessage) -> Result<NormalizedRecord, ParseError> {
    let sender = required(mail.from.as_deref(), "from")?;
    let body = present(mail.body_plain.as_deref())
        .or_else(|| present(mail.snippet.as_deref()))
        .ok_or(ParseError::MissingField("body"))?;
    let received_at = timestamp(mail.internal_date_ms, "internal_date_ms")?;

    let mut record = NormalizedRecord::new(Source::Mail, received_at, sender, body);
    if let Some(subject) = present(mail.subject.as_deref()) {
        record = record.with_subject(subject);
    }
    if let Some(id) = present(mail.id.as_deref()) {
        record = record.with_platform_id(id);
    }
    Ok(record)
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ParseError> {
    present(value).ok_or(ParseError::MissingField(field))
}

fn timestamp(ms: Option<i64>, field: &'static str) -> Result<DateTime<Utc>, ParseError> {
    let ms = ms.ok_or(ParseError::MissingField(field))?;
    if ms <= 0 {
        return Err(ParseError::InvalidTimestamp(ms));
    }
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(ParseError::InvalidTimestamp(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: i64 = 1_714_000_000_123;

    fn sms(sender: Option<&str>, parts: &[&str], ts: Option<i64>) -> RawEvent {
        RawEvent::Sms(SmsPayload {
            message_id: Some("sms-1".into()),
            sender: sender.map(String::from),
            parts: parts.iter().map(|p| p.to_string()).collect(),
            timestamp_ms: ts,
        })
    }

    fn mail() -> MailMessage {
        MailMessage {
            id: Some("m-1".into()),
            history_id: 10,
            from: Some("Bank <alerts@bank.example>".into()),
            subject: Some("Verify your account".into()),
            body_plain: Some("Click https://bank.example.evil/login".into()),
            snippet: Some("Click https://bank...".into()),
            internal_date_ms: Some(TS),
            labels: vec!["INBOX".into()],
        }
    }

    #[test]
    fn sms_round_trips_sender_body_and_timestamp() {
        let record = normalize(&sms(Some("+15550001"), &["Your code is 1234"], Some(TS))).unwrap();
        assert_eq!(record.source(), Source::Sms);
        assert_eq!(record.sender(), "+15550001");
        assert_eq!(record.body(), "Your code is 1234");
        assert_eq!(record.received_at().timestamp_millis(), TS);
        assert_eq!(record.platform_id(), Some("sms-1"));
        assert_eq!(record.subject(), None);
    }

    #[test]
    fn sms_parts_are_concatenated_in_order() {
        let record = normalize(&sms(Some("+1"), &["Hello ", "from ", "part three"], Some(TS))).unwrap();
        assert_eq!(record.body(), "Hello from part three");
    }

    #[test]
    fn body_whitespace_is_preserved() {
        let record = normalize(&sms(Some(" +1 "), &["  padded body \n"], Some(TS))).unwrap();
        assert_eq!(record.sender(), " +1 ");
        assert_eq!(record.body(), "  padded body \n");
    }

    #[test]
    fn sms_missing_sender_is_an_error() {
        assert_eq!(
            normalize(&sms(None, &["hi"], Some(TS))),
            Err(ParseError::MissingField("sender"))
        );
        assert_eq!(
            normalize(&sms(Some("   "), &["hi"], Some(TS))),
            Err(ParseError::MissingField("sender"))
        );
    }

    #[test]
    fn sms_without_body_is_an_error() {
        assert_eq!(
            normalize(&sms(Some("+1"), &[], Some(TS))),
            Err(ParseError::MissingField("body"))
        );
        assert_eq!(
            normalize(&sms(Some("+1"), &["", " "], Some(TS))),
            Err(ParseError::MissingField("body"))
        );
    }

    #[test]
    fn sms_timestamp_must_be_present_and_valid() {
        assert_eq!(
            normalize(&sms(Some("+1"), &["hi"], None)),
            Err(ParseError::MissingField("timestamp_ms"))
        );
        assert_eq!(
            normalize(&sms(Some("+1"), &["hi"], Some(-5))),
            Err(ParseError::InvalidTimestamp(-5))
        );
        assert_eq!(
            normalize(&sms(Some("+1"), &["hi"], Some(i64::MAX))),
            Err(ParseError::InvalidTimestamp(i64::MAX))
        );
    }

    #[test]
    fn blank_message_id_means_content_keyed_record() {
        let raw = RawEvent::Sms(SmsPayload {
            message_id: Some(String::new()),
            sender: Some("+1".into()),
            parts: vec!["hi".into()],
            timestamp_ms: Some(TS),
        });
        let record = normalize(&raw).unwrap();
        assert_eq!(record.platform_id(), None);
    }

    #[test]
    fn mail_prefers_plain_body_and_keeps_subject() {
        let record = normalize(&RawEvent::Mail(mail())).unwrap();
        assert_eq!(record.source(), Source::Mail);
        assert_eq!(record.sender(), "Bank <alerts@bank.example>");
        assert_eq!(record.body(), "Click https://bank.example.evil/login");
        assert_eq!(record.subject(), Some("Verify your account"));
        assert_eq!(record.platform_id(), Some("m-1"));
        assert_eq!(record.received_at().timestamp_millis(), TS);
    }

    #[test]
    fn mail_falls_back_to_snippet() {
        let mut message = mail();
        message.body_plain = None;
        let record = normalize(&RawEvent::Mail(message)).unwrap();
        assert_eq!(record.body(), "Click https://bank...");
    }

    #[test]
    fn mail_missing_fields_are_errors() {
        let mut no_from = mail();
        no_from.from = None;
        assert_eq!(
            normalize(&RawEvent::Mail(no_from)),
            Err(ParseError::MissingField("from"))
        );

        let mut no_body = mail();
        no_body.body_plain = None;
        no_body.snippet = Some("  ".into());
        assert_eq!(
            normalize(&RawEvent::Mail(no_body)),
            Err(ParseError::MissingField("body"))
        );

        let mut no_date = mail();
        no_date.internal_date_ms = None;
        assert_eq!(
            normalize(&RawEvent::Mail(no_date)),
            Err(ParseError::MissingField("internal_date_ms"))
        );
    }
}
