//! Geofence crossing detection: load a polygonal boundary from a GML
//! file at init, track whether incoming positions are inside or outside,
//! and emit the configured message on each transition.
//!
//! Distances are planar and in degrees; computing true distance in km or
//! nm needs a per-location UTM projection and is deliberately avoided.

use super::Transform;
use crate::record::{Payload, Value};
use crate::timeutil;
use regex::Regex;
use tracing::*;

/// A closed boundary as (lon, lat) vertices.
#[derive(Clone, Debug)]
pub struct Boundary {
	vertices: Vec<(f64, f64)>,
}

lazy_static::lazy_static! {
	static ref POS_LIST: Regex =
		Regex::new(r"<(?:\w+:)?posList[^>]*>([^<]+)</(?:\w+:)?posList>").expect("static regex");
	static ref COORDINATES: Regex =
		Regex::new(r"<(?:\w+:)?coordinates[^>]*>([^<]+)</(?:\w+:)?coordinates>")
			.expect("static regex");
}

impl Boundary {
	/// Parse the first LinearRing out of GML content. `posList` holds
	/// whitespace-separated `lon lat` pairs; GML2 `coordinates` holds
	/// comma-joined `lon,lat` tuples.
	pub fn from_gml(content: &str) -> anyhow::Result<Boundary> {
		let mut vertices: Vec<(f64, f64)> = Vec::new();
		if let Some(captures) = POS_LIST.captures(content) {
			let numbers: Vec<f64> = captures[1]
				.split_whitespace()
				.filter_map(|token| token.parse().ok())
				.collect();
			if numbers.len() % 2 != 0 {
				anyhow::bail!("posList holds an odd number of coordinates");
			}
			vertices = numbers.chunks(2).map(|pair| (pair[0], pair[1])).collect();
		} else if let Some(captures) = COORDINATES.captures(content) {
			for tuple in captures[1].split_whitespace() {
				let mut parts = tuple.split(',');
				let lon: f64 = parts
					.next()
					.and_then(|p| p.parse().ok())
					.ok_or_else(|| anyhow::anyhow!("bad coordinate tuple {:?}", tuple))?;
				let lat: f64 = parts
					.next()
					.and_then(|p| p.parse().ok())
					.ok_or_else(|| anyhow::anyhow!("bad coordinate tuple {:?}", tuple))?;
				vertices.push((lon, lat));
			}
		}
		if vertices.len() < 3 {
			anyhow::bail!("no usable LinearRing found in GML boundary");
		}
		Ok(Boundary { vertices })
	}

	pub fn from_file(path: &str) -> anyhow::Result<Boundary> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| anyhow::anyhow!("unable to read boundary file {:?}: {}", path, e))?;
		Self::from_gml(&content)
	}

	fn contains(&self, lon: f64, lat: f64) -> bool {
		let mut inside = false;
		let n = self.vertices.len();
		let mut j = n - 1;
		for i in 0..n {
			let (xi, yi) = self.vertices[i];
			let (xj, yj) = self.vertices[j];
			if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
				inside = !inside;
			}
			j = i;
		}
		inside
	}

	fn distance_to_edge(&self, lon: f64, lat: f64) -> f64 {
		let mut best = f64::INFINITY;
		let n = self.vertices.len();
		for i in 0..n {
			let a = self.vertices[i];
			let b = self.vertices[(i + 1) % n];
			best = best.min(point_segment_distance((lon, lat), a, b));
		}
		best
	}

	/// Inside test with an outward (or, negative, inward) buffer in
	/// degrees.
	pub fn contains_buffered(&self, lon: f64, lat: f64, buffer: f64) -> bool {
		let inside = self.contains(lon, lat);
		if buffer == 0.0 {
			return inside;
		}
		let distance = self.distance_to_edge(lon, lat);
		if buffer > 0.0 {
			inside || distance <= buffer
		} else {
			inside && distance >= -buffer
		}
	}
}

fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
	let (px, py) = p;
	let (ax, ay) = a;
	let (bx, by) = b;
	let dx = bx - ax;
	let dy = by - ay;
	let len_sq = dx * dx + dy * dy;
	let t = if len_sq == 0.0 {
		0.0
	} else {
		(((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
	};
	let cx = ax + t * dx;
	let cy = ay + t * dy;
	((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

#[derive(serde::Deserialize)]
struct GeofenceConfig {
	latitude_field_name: String,
	longitude_field_name: String,
	boundary_file_name: String,
	#[serde(default)]
	distance_from_boundary_in_degrees: f64,
	#[serde(default)]
	leaving_boundary_message: Option<String>,
	#[serde(default)]
	entering_boundary_message: Option<String>,
	#[serde(default)]
	seconds_between_checks: f64,
}

pub struct GeofenceTransform {
	latitude_field: String,
	longitude_field: String,
	boundary: Boundary,
	buffer: f64,
	leaving_message: Option<String>,
	entering_message: Option<String>,
	seconds_between_checks: f64,
	last_position_inside: Option<bool>,
	last_check: f64,
}

impl GeofenceTransform {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: GeofenceConfig = serde_json::from_value(kwargs.clone())?;
		let boundary = Boundary::from_file(&config.boundary_file_name)?;
		Ok(Self::with_boundary(config, boundary))
	}

	fn with_boundary(config: GeofenceConfig, boundary: Boundary) -> Self {
		GeofenceTransform {
			latitude_field: config.latitude_field_name,
			longitude_field: config.longitude_field_name,
			boundary,
			buffer: config.distance_from_boundary_in_degrees,
			leaving_message: config.leaving_boundary_message,
			entering_message: config.entering_boundary_message,
			seconds_between_checks: config.seconds_between_checks,
			last_position_inside: None,
			last_check: 0.0,
		}
	}
}

impl Transform for GeofenceTransform {
	fn process(&mut self, payload: Payload) -> Option<Payload> {
		// The throttle exists for computational efficiency, so it runs on
		// system time rather than record timestamps.
		let now = timeutil::now();
		if self.seconds_between_checks > 0.0 && now - self.last_check < self.seconds_between_checks
		{
			debug!("Geofence check throttled");
			return None;
		}

		let record = match payload {
			Payload::Record(record) => record,
			other => {
				debug!("GeofenceTransform received non-record input: {}", other.describe());
				return None;
			}
		};
		let lat = record
			.fields
			.get(&self.latitude_field)
			.and_then(Value::as_number)?;
		let lon = record
			.fields
			.get(&self.longitude_field)
			.and_then(Value::as_number)?;

		self.last_check = now;
		let is_inside = self.boundary.contains_buffered(lon, lat, self.buffer);
		if self.last_position_inside == Some(is_inside) {
			return None;
		}
		self.last_position_inside = Some(is_inside);
		let message = if is_inside {
			self.entering_message.clone()
		} else {
			self.leaving_message.clone()
		};
		message.map(Payload::Text)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::{Fields, Record};
	use std::io::Write;

	const SQUARE_GML: &str = r#"<?xml version="1.0"?>
<gml:FeatureCollection xmlns:gml="http://www.opengis.net/gml">
  <gml:Polygon>
    <gml:exterior>
      <gml:LinearRing>
        <gml:posList>0 0 10 0 10 10 0 10 0 0</gml:posList>
      </gml:LinearRing>
    </gml:exterior>
  </gml:Polygon>
</gml:FeatureCollection>
"#;

	fn transform(buffer: f64) -> GeofenceTransform {
		let boundary = Boundary::from_gml(SQUARE_GML).unwrap();
		GeofenceTransform::with_boundary(
			GeofenceConfig {
				latitude_field_name: "Latitude".to_owned(),
				longitude_field_name: "Longitude".to_owned(),
				boundary_file_name: String::new(),
				distance_from_boundary_in_degrees: buffer,
				leaving_boundary_message: Some("leaving".to_owned()),
				entering_boundary_message: Some("entering".to_owned()),
				seconds_between_checks: 0.0,
			},
			boundary,
		)
	}

	fn position(lat: f64, lon: f64) -> Payload {
		let mut fields = Fields::new();
		fields.insert("Latitude".to_owned(), Value::Float(lat));
		fields.insert("Longitude".to_owned(), Value::Float(lon));
		Payload::Record(Record::with_fields(100.0, fields))
	}

	#[test]
	fn parses_gml2_coordinates_too() {
		let gml = r#"<coordinates>0,0 4,0 4,4 0,4 0,0</coordinates>"#;
		let boundary = Boundary::from_gml(gml).unwrap();
		assert!(boundary.contains(2.0, 2.0));
		assert!(!boundary.contains(5.0, 2.0));
	}

	#[test]
	fn emits_on_transitions_only() {
		let mut t = transform(0.0);
		// First position inside: entering message fires immediately.
		assert_eq!(
			t.transform(position(5.0, 5.0)),
			Some(Payload::Text("entering".to_owned()))
		);
		// Still inside: silent.
		assert!(t.transform(position(6.0, 6.0)).is_none());
		// Crossing out.
		assert_eq!(
			t.transform(position(20.0, 20.0)),
			Some(Payload::Text("leaving".to_owned()))
		);
		// Still outside: silent.
		assert!(t.transform(position(21.0, 20.0)).is_none());
		// And back in.
		assert_eq!(
			t.transform(position(1.0, 1.0)),
			Some(Payload::Text("entering".to_owned()))
		);
	}

	#[test]
	fn buffer_extends_the_fence() {
		let mut t = transform(2.0);
		// Within two degrees of the edge counts as inside.
		assert_eq!(
			t.transform(position(5.0, 11.5)),
			Some(Payload::Text("entering".to_owned()))
		);
		assert_eq!(
			t.transform(position(5.0, 13.0)),
			Some(Payload::Text("leaving".to_owned()))
		);
	}

	#[test]
	fn negative_buffer_shrinks_the_fence() {
		let mut t = transform(-2.0);
		// Inside the ring but within two degrees of the edge: outside.
		assert_eq!(
			t.transform(position(5.0, 9.5)),
			Some(Payload::Text("leaving".to_owned()))
		);
		assert_eq!(
			t.transform(position(5.0, 5.0)),
			Some(Payload::Text("entering".to_owned()))
		);
	}

	#[test]
	fn missing_position_fields_are_ignored() {
		let mut t = transform(0.0);
		let mut fields = Fields::new();
		fields.insert("Other".to_owned(), Value::Float(1.0));
		assert!(t
			.transform(Payload::Record(Record::with_fields(100.0, fields)))
			.is_none());
	}

	#[test]
	fn loads_boundary_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("eez.gml");
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(SQUARE_GML.as_bytes()).unwrap();

		let mut t = GeofenceTransform::from_config(&serde_json::json!({
			"latitude_field_name": "Latitude",
			"longitude_field_name": "Longitude",
			"boundary_file_name": path.to_str().unwrap()
		}))
		.unwrap();
		assert!(t.transform(position(5.0, 5.0)).is_none());
	}
}
