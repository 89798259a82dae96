use crate::error::IngestError;
use serde::Deserialize;

/// One weather reading as published by the collector.
///
/// Coordinates are kept as the producer sent them; nothing here is range checked.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeatherRecord {
    pub temperature: f64,
    pub windspeed: f64,
    pub latitude: String,
    pub longitude: String,
    pub timestamp: f64,
}

impl WeatherRecord {
    pub fn summary(&self) -> String {
        format!(
            "Temp {:.1}ºC | Wind {:.1} km/h",
            self.temperature, self.windspeed
        )
    }
}

/// Decodes a queue message body. simd-json parses in place, so the buffer is clobbered.
pub fn decode_payload(payload: &mut [u8]) -> Result<WeatherRecord, IngestError> {
    let record: WeatherRecord = simd_json::from_slice(payload)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{"temperature":21.5,"windspeed":12.3,"latitude":"-23.55","longitude":"-46.63","timestamp":1700000000}"#;

    #[test]
    fn decodes_collector_payload_verbatim() {
        let mut payload = SCENARIO.as_bytes().to_vec();
        let record = decode_payload(&mut payload).expect("decoded");
        assert_eq!(record.temperature, 21.5);
        assert_eq!(record.windspeed, 12.3);
        assert_eq!(record.latitude, "-23.55");
        assert_eq!(record.longitude, "-46.63");
        assert_eq!(record.timestamp, 1_700_000_000.0);
        assert_eq!(record.summary(), "Temp 21.5ºC | Wind 12.3 km/h");
    }

    #[test]
    fn decoding_same_payload_twice_is_stable() {
        let mut first = SCENARIO.as_bytes().to_vec();
        let mut second = SCENARIO.as_bytes().to_vec();
        assert_eq!(
            decode_payload(&mut first).unwrap(),
            decode_payload(&mut second).unwrap()
        );
    }

    #[test]
    fn fractional_timestamp_and_extra_fields_are_accepted() {
        let mut payload = br#"{
            "temperature": -3,
            "windspeed": 0.0,
            "latitude": "not really a latitude",
            "longitude": "",
            "timestamp": 1700000000.125,
            "source": "open-meteo"
        }"#
        .to_vec();
        let record = decode_payload(&mut payload).expect("decoded");
        assert_eq!(record.temperature, -3.0);
        assert_eq!(record.latitude, "not really a latitude");
        assert_eq!(record.timestamp, 1_700_000_000.125);
    }

    #[test]
    fn wrong_type_is_malformed() {
        let mut payload = br#"{"temperature":"not-a-number"}"#.to_vec();
        let err = decode_payload(&mut payload).unwrap_err();
        assert!(matches!(err, IngestError::MalformedPayload(_)));
    }

    #[test]
    fn missing_field_is_malformed() {
        let mut payload =
            br#"{"temperature":21.5,"windspeed":12.3,"latitude":"-23.55","timestamp":1}"#.to_vec();
        let err = decode_payload(&mut payload).unwrap_err();
        assert!(matches!(err, IngestError::MalformedPayload(_)));
    }

    #[test]
    fn numeric_coordinates_are_malformed() {
        let mut payload = br#"{"temperature":21.5,"windspeed":12.3,"latitude":-23.55,"longitude":"-46.63","timestamp":1}"#
            .to_vec();
        assert!(decode_payload(&mut payload).is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        for raw in [&b""[..], &b"not json"[..], &b"[1,2,3]"[..], &b"{\"temperature\":21.5"[..]] {
            let mut payload = raw.to_vec();
            assert!(
                matches!(
                    decode_payload(&mut payload),
                    Err(IngestError::MalformedPayload(_))
                ),
                "payload {:?} should be rejected",
                String::from_utf8_lossy(raw)
            );
        }
    }
}
