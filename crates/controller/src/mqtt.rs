use rumqttc::{AsyncClient, QoS};
use tracing::warn;

use crate::events::Event;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Topic for an event under `prefix`, e.g. "sprinkler/station/3".
pub(crate) fn event_topic(prefix: &str, event: &Event) -> String {
    let suffix = match event {
        Event::StationOn { station } | Event::StationOff { station, .. } => format!("station/{station}"),
        Event::ProgramScheduled { .. } => "program".to_string(),
        Event::SensorChanged { sensor, .. } => format!("sensor{sensor}"),
        Event::RainDelayChanged { .. } => "raindelay".to_string(),
        Event::FlowSummary { .. } => "sensor/flow".to_string(),
        Event::WeatherUpdated { .. } => "weather".to_string(),
        Event::Reboot { .. } => "system".to_string(),
    };
    format!("{}/{suffix}", prefix.trim_end_matches('/'))
}

/// JSON body for an event.
pub(crate) fn event_payload(event: &Event) -> Vec<u8> {
    serde_json::to_vec(event).unwrap_or_default()
}

/// Messages to publish for `events`, dropping those the mask disables.
pub(crate) fn outgoing(prefix: &str, notify_mask: u16, events: &[Event]) -> Vec<(String, Vec<u8>)> {
    events
        .iter()
        .filter(|e| e.is_enabled(notify_mask))
        .map(|e| (event_topic(prefix, e), event_payload(e)))
        .collect()
}

/// Queue notifications without waiting; a full client queue drops them.
pub(crate) fn publish_events(client: &AsyncClient, prefix: &str, notify_mask: u16, events: &[Event]) {
    for (topic, payload) in outgoing(prefix, notify_mask, events) {
        if let Err(e) = client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload) {
            warn!(topic = %topic, "mqtt: publish dropped: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{notify, RebootCause};
    use crate::queue::RunSource;

    // -- event_topic --------------------------------------------------------

    #[test]
    fn station_events_share_a_topic() {
        let on = Event::StationOn { station: 4 };
        let off = Event::StationOff {
            station: 4,
            source: RunSource::Manual,
            start: 0,
            duration: 10,
            flow_volume: None,
        };
        assert_eq!(event_topic("sprinkler", &on), "sprinkler/station/4");
        assert_eq!(event_topic("sprinkler", &off), "sprinkler/station/4");
    }

    #[test]
    fn sensor_topics_are_numbered() {
        let s2 = Event::SensorChanged { sensor: 2, active: true };
        assert_eq!(event_topic("yard", &s2), "yard/sensor2");
    }

    #[test]
    fn flow_and_system_topics() {
        let flow = Event::FlowSummary { pulses: 3, volume: 1.5 };
        let reboot = Event::Reboot {
            cause: RebootCause::Program,
        };
        assert_eq!(event_topic("yard", &flow), "yard/sensor/flow");
        assert_eq!(event_topic("yard", &reboot), "yard/system");
    }

    #[test]
    fn trailing_slash_in_prefix_is_ignored() {
        let e = Event::RainDelayChanged { active: false };
        assert_eq!(event_topic("yard/", &e), "yard/raindelay");
    }

    // -- payload / filtering ------------------------------------------------

    #[test]
    fn payload_is_tagged_json() {
        let body = event_payload(&Event::WeatherUpdated { water_level: 70 });
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["event"], "weather_updated");
        assert_eq!(v["water_level"], 70);
    }

    #[test]
    fn notify_mask_filters_outgoing() {
        let events = vec![
            Event::StationOn { station: 1 },
            Event::WeatherUpdated { water_level: 50 },
            Event::RainDelayChanged { active: true },
        ];
        let msgs = outgoing("p", notify::STATION_ON | notify::RAIN_DELAY, &events);
        let topics: Vec<&str> = msgs.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["p/station/1", "p/raindelay"]);
    }

    #[test]
    fn empty_mask_publishes_nothing() {
        assert!(outgoing("p", 0, &[Event::StationOn { station: 1 }]).is_empty());
    }
}
