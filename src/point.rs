use crate::meter::MeasurementSet;

/// Measurement name identifying the meter model in the time-series store.
pub const MEASUREMENT_NAME: &str = "pzem-004t";

/// One forwarding unit: measurement name, tag set, field set. Constructed
/// fresh immediately before each publish and dropped after the write attempt.
#[derive(Debug, Clone)]
pub struct DataPoint {
    measurement: &'static str,
    tags: Vec<(String, String)>,
    fields: Vec<(&'static str, f64)>,
}

impl DataPoint {
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn fields(&self) -> &[(&'static str, f64)] {
        &self.fields
    }

    /// Serializes into the InfluxDB line protocol:
    /// `measurement,tag=value field=value,...` — no trailing timestamp, the
    /// server assigns receipt time.
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::with_capacity(160);
        escape_ident(self.measurement, &mut line);
        for (key, value) in &self.tags {
            line.push(',');
            escape_ident(key, &mut line);
            line.push('=');
            escape_ident(value, &mut line);
        }
        line.push(' ');
        let mut first = true;
        for (key, value) in &self.fields {
            if first {
                first = false;
            } else {
                line.push(',');
            }
            escape_ident(key, &mut line);
            line.push('=');
            line.push_str(&value.to_string());
        }
        line
    }
}

/// Maps a [`MeasurementSet`] plus the fixed device tag into a [`DataPoint`].
/// Pure transformation: every metric is mirrored verbatim, non-finite values
/// included. Validity screening belongs to the reader stage, not here.
#[derive(Debug, Clone)]
pub struct PointBuilder {
    device_tag: String,
}

impl PointBuilder {
    pub fn new(device_tag: impl Into<String>) -> Self {
        Self {
            device_tag: device_tag.into(),
        }
    }

    pub fn build(&self, set: &MeasurementSet) -> DataPoint {
        DataPoint {
            measurement: MEASUREMENT_NAME,
            tags: vec![("device".to_string(), self.device_tag.clone())],
            fields: set
                .readings()
                .map(|reading| (reading.metric.field_name(), reading.value))
                .collect(),
        }
    }
}

/// Line protocol requires escaping commas, spaces and equals in measurement
/// names, tag keys/values and field keys with a backslash.
fn escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::{Metric, MetricReading};

    fn sample_set() -> MeasurementSet {
        let mut set = MeasurementSet::new();
        for (metric, value) in [
            (Metric::Voltage, 220.1),
            (Metric::Current, 0.45),
            (Metric::Power, 99.0),
            (Metric::Frequency, 50.0),
            (Metric::TotalEnergyGenerated, 12.34),
            (Metric::PowerFactor, 0.98),
        ] {
            set.set(MetricReading { metric, value });
        }
        set
    }

    #[test]
    fn escape_ident_escapes_commas_spaces_and_equals() {
        let mut out = String::new();
        escape_ident("a b,c=d", &mut out);
        assert_eq!(out, "a\\ b\\,c\\=d");
    }

    #[test]
    fn builds_all_six_fields_with_device_tag() {
        let point = PointBuilder::new("node-1").build(&sample_set());

        assert_eq!(point.fields().len(), 6);
        assert_eq!(
            point.tags(),
            &[("device".to_string(), "node-1".to_string())]
        );
    }

    #[test]
    fn serializes_fields_in_fixed_order_without_timestamp() {
        let point = PointBuilder::new("node-1").build(&sample_set());

        assert_eq!(
            point.to_line_protocol(),
            "pzem-004t,device=node-1 voltage=220.1,current=0.45,power=99,\
             frequency=50,total_energy_generated=12.34,power_factor=0.98"
        );
    }

    #[test]
    fn invalid_readings_pass_through_as_nan() {
        let mut set = sample_set();
        set.set(MetricReading::invalid(Metric::Current));

        let point = PointBuilder::new("node-1").build(&set);
        let line = point.to_line_protocol();

        assert!(line.contains("current=NaN"));
        assert!(line.contains("voltage=220.1"));
        assert_eq!(point.fields().len(), 6);
    }

    #[test]
    fn tag_values_are_escaped() {
        let point = PointBuilder::new("node 1,a=b").build(&sample_set());

        assert!(point
            .to_line_protocol()
            .starts_with("pzem-004t,device=node\\ 1\\,a\\=b "));
    }
}
