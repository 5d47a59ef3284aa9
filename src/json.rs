//! Canonical JSON rendering of GTFS-RT feeds.
//!
//! Output follows the protobuf JSON mapping with a fixed set of options:
//!
//! - keys are the `.proto` field names (`gtfs_realtime_version`, not
//!   `gtfsRealtimeVersion`), in declaration order
//! - optional fields are written only when set and repeated fields only when
//!   non-empty; `required` fields are always written, since
//!   [`parse_feed`](crate::parser::parse_feed) rejects feeds that omit them
//! - 64-bit integers are strings, enums are their value names
//! - `float` fields use the shortest decimal that round-trips through `f32`,
//!   and whole numbers have no fractional part (`180`, not `180.0`)
//! - two-space indentation
//!
//! The same feed always renders to the same bytes.

use std::io;

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter, Serializer};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::gtfs_rt::{
    Alert, EntitySelector, FeedEntity, FeedHeader, FeedMessage, Position, ReplacementStop, Shape,
    Stop, StopSelector, TimeRange, TranslatedImage, TranslatedString, TripDescriptor,
    TripModifications, TripUpdate, VehicleDescriptor, VehiclePosition, alert, feed_header, stop,
    translated_image, translated_string, trip_descriptor, trip_modifications, trip_update,
    vehicle_descriptor, vehicle_position,
};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to serialize feed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Renders a feed as indented JSON text.
pub fn to_json(feed: &FeedMessage) -> Result<Vec<u8>, RenderError> {
    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, ProtoJsonFormatter::default());
    to_value(feed).serialize(&mut serializer)?;
    Ok(out)
}

/// Renders a feed as a JSON tree.
pub fn to_value(feed: &FeedMessage) -> Value {
    feed.render()
}

/// Two-space pretty printer that writes integral floating-point numbers
/// without a fraction, as protobuf JSON printers do.
#[derive(Default)]
struct ProtoJsonFormatter<'a>(PrettyFormatter<'a>);

impl Formatter for ProtoJsonFormatter<'_> {
    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        // Beyond 1e21 printers switch to exponent notation.
        if value.fract() == 0.0 && value.abs() < 1e21 {
            write!(writer, "{value:.0}")
        } else {
            self.0.write_f64(writer, value)
        }
    }

    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_value(writer)
    }
}

trait Render {
    fn render(&self) -> Value;
}

/// Generated enums expose their names through an inherent method only.
trait ProtoEnum: TryFrom<i32> {
    fn name(&self) -> &'static str;
}

macro_rules! proto_enums {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ProtoEnum for $ty {
                fn name(&self) -> &'static str {
                    self.as_str_name()
                }
            }
        )*
    };
}

proto_enums!(
    feed_header::Incrementality,
    trip_update::stop_time_update::ScheduleRelationship,
    trip_update::stop_time_update::stop_time_properties::DropOffPickupType,
    vehicle_position::VehicleStopStatus,
    vehicle_position::CongestionLevel,
    vehicle_position::OccupancyStatus,
    alert::Cause,
    alert::Effect,
    alert::SeverityLevel,
    trip_descriptor::ScheduleRelationship,
    vehicle_descriptor::WheelchairAccessible,
    stop::WheelchairBoarding,
);

/// Name of a known enum value, or the raw number for values this schema
/// revision does not know about.
fn enum_value<E: ProtoEnum>(raw: i32) -> Value {
    match E::try_from(raw) {
        Ok(value) => Value::from(value.name()),
        Err(_) => Value::from(raw),
    }
}

fn float(v: f32) -> Value {
    // Display on f32 yields the shortest decimal for the 32-bit value, so
    // 42.1f32 renders as 42.1 rather than 42.099998474121094.
    match v.to_string().parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        None => non_finite(f64::from(v)),
    }
}

fn double(v: f64) -> Value {
    Number::from_f64(v).map_or_else(|| non_finite(v), Value::Number)
}

fn non_finite(v: f64) -> Value {
    let s = if v.is_nan() {
        "NaN"
    } else if v.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    };
    Value::from(s)
}

/// Builds one JSON object, skipping unset fields.
#[derive(Default)]
struct Object(Map<String, Value>);

impl Object {
    fn new() -> Self {
        Self::default()
    }

    fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    fn opt<T: Into<Value>>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    fn opt_u64(self, name: &str, value: Option<u64>) -> Self {
        self.opt(name, value.map(|v| v.to_string()))
    }

    fn opt_i64(self, name: &str, value: Option<i64>) -> Self {
        self.opt(name, value.map(|v| v.to_string()))
    }

    fn opt_float(self, name: &str, value: Option<f32>) -> Self {
        self.opt(name, value.map(float))
    }

    fn opt_double(self, name: &str, value: Option<f64>) -> Self {
        self.opt(name, value.map(double))
    }

    fn opt_enum<E: ProtoEnum>(self, name: &str, value: Option<i32>) -> Self {
        self.opt(name, value.map(enum_value::<E>))
    }

    fn message<M: Render>(self, name: &str, value: &M) -> Self {
        self.field(name, value.render())
    }

    fn opt_message<M: Render>(self, name: &str, value: &Option<M>) -> Self {
        self.opt(name, value.as_ref().map(Render::render))
    }

    fn repeated<M: Render>(self, name: &str, values: &[M]) -> Self {
        if values.is_empty() {
            return self;
        }
        self.field(name, values.iter().map(Render::render).collect::<Vec<_>>())
    }

    fn strings(self, name: &str, values: &[String]) -> Self {
        if values.is_empty() {
            return self;
        }
        self.field(name, values.to_vec())
    }

    fn build(self) -> Value {
        Value::Object(self.0)
    }
}

impl Render for FeedMessage {
    fn render(&self) -> Value {
        Object::new()
            .message("header", &self.header)
            .repeated("entity", &self.entity)
            .build()
    }
}

impl Render for FeedHeader {
    fn render(&self) -> Value {
        Object::new()
            .field("gtfs_realtime_version", self.gtfs_realtime_version.as_str())
            .opt_enum::<feed_header::Incrementality>("incrementality", self.incrementality)
            .opt_u64("timestamp", self.timestamp)
            .opt("feed_version", self.feed_version.as_deref())
            .build()
    }
}

impl Render for FeedEntity {
    fn render(&self) -> Value {
        Object::new()
            .field("id", self.id.as_str())
            .opt("is_deleted", self.is_deleted)
            .opt_message("trip_update", &self.trip_update)
            .opt_message("vehicle", &self.vehicle)
            .opt_message("alert", &self.alert)
            .opt_message("shape", &self.shape)
            .opt_message("stop", &self.stop)
            .opt_message("trip_modifications", &self.trip_modifications)
            .build()
    }
}

impl Render for TripUpdate {
    fn render(&self) -> Value {
        Object::new()
            .message("trip", &self.trip)
            .opt_message("vehicle", &self.vehicle)
            .repeated("stop_time_update", &self.stop_time_update)
            .opt_u64("timestamp", self.timestamp)
            .opt("delay", self.delay)
            .opt_message("trip_properties", &self.trip_properties)
            .build()
    }
}

impl Render for trip_update::StopTimeEvent {
    fn render(&self) -> Value {
        Object::new()
            .opt("delay", self.delay)
            .opt_i64("time", self.time)
            .opt("uncertainty", self.uncertainty)
            .opt_i64("scheduled_time", self.scheduled_time)
            .build()
    }
}

impl Render for trip_update::StopTimeUpdate {
    fn render(&self) -> Value {
        use trip_update::stop_time_update::ScheduleRelationship;

        Object::new()
            .opt("stop_sequence", self.stop_sequence)
            .opt("stop_id", self.stop_id.as_deref())
            .opt_message("arrival", &self.arrival)
            .opt_message("departure", &self.departure)
            .opt_enum::<vehicle_position::OccupancyStatus>(
                "departure_occupancy_status",
                self.departure_occupancy_status,
            )
            .opt_enum::<ScheduleRelationship>("schedule_relationship", self.schedule_relationship)
            .opt_message("stop_time_properties", &self.stop_time_properties)
            .build()
    }
}

impl Render for trip_update::stop_time_update::StopTimeProperties {
    fn render(&self) -> Value {
        use trip_update::stop_time_update::stop_time_properties::DropOffPickupType;

        Object::new()
            .opt("assigned_stop_id", self.assigned_stop_id.as_deref())
            .opt("stop_headsign", self.stop_headsign.as_deref())
            .opt_enum::<DropOffPickupType>("pickup_type", self.pickup_type)
            .opt_enum::<DropOffPickupType>("drop_off_type", self.drop_off_type)
            .build()
    }
}

impl Render for trip_update::TripProperties {
    fn render(&self) -> Value {
        Object::new()
            .opt("trip_id", self.trip_id.as_deref())
            .opt("start_date", self.start_date.as_deref())
            .opt("start_time", self.start_time.as_deref())
            .opt("shape_id", self.shape_id.as_deref())
            .opt("trip_headsign", self.trip_headsign.as_deref())
            .opt("trip_short_name", self.trip_short_name.as_deref())
            .build()
    }
}

impl Render for VehiclePosition {
    fn render(&self) -> Value {
        Object::new()
            .opt_message("trip", &self.trip)
            .opt_message("vehicle", &self.vehicle)
            .opt_message("position", &self.position)
            .opt("current_stop_sequence", self.current_stop_sequence)
            .opt("stop_id", self.stop_id.as_deref())
            .opt_enum::<vehicle_position::VehicleStopStatus>("current_status", self.current_status)
            .opt_u64("timestamp", self.timestamp)
            .opt_enum::<vehicle_position::CongestionLevel>("congestion_level", self.congestion_level)
            .opt_enum::<vehicle_position::OccupancyStatus>("occupancy_status", self.occupancy_status)
            .opt("occupancy_percentage", self.occupancy_percentage)
            .repeated("multi_carriage_details", &self.multi_carriage_details)
            .build()
    }
}

impl Render for vehicle_position::CarriageDetails {
    fn render(&self) -> Value {
        Object::new()
            .opt("id", self.id.as_deref())
            .opt("label", self.label.as_deref())
            .opt_enum::<vehicle_position::OccupancyStatus>("occupancy_status", self.occupancy_status)
            .opt("occupancy_percentage", self.occupancy_percentage)
            .opt("carriage_sequence", self.carriage_sequence)
            .build()
    }
}

impl Render for Alert {
    fn render(&self) -> Value {
        Object::new()
            .repeated("active_period", &self.active_period)
            .repeated("informed_entity", &self.informed_entity)
            .opt_enum::<alert::Cause>("cause", self.cause)
            .opt_enum::<alert::Effect>("effect", self.effect)
            .opt_message("url", &self.url)
            .opt_message("header_text", &self.header_text)
            .opt_message("description_text", &self.description_text)
            .opt_message("tts_header_text", &self.tts_header_text)
            .opt_message("tts_description_text", &self.tts_description_text)
            .opt_enum::<alert::SeverityLevel>("severity_level", self.severity_level)
            .opt_message("image", &self.image)
            .opt_message("image_alternative_text", &self.image_alternative_text)
            .opt_message("cause_detail", &self.cause_detail)
            .opt_message("effect_detail", &self.effect_detail)
            .build()
    }
}

impl Render for TimeRange {
    fn render(&self) -> Value {
        Object::new()
            .opt_u64("start", self.start)
            .opt_u64("end", self.end)
            .build()
    }
}

impl Render for Position {
    fn render(&self) -> Value {
        Object::new()
            .field("latitude", float(self.latitude))
            .field("longitude", float(self.longitude))
            .opt_float("bearing", self.bearing)
            .opt_double("odometer", self.odometer)
            .opt_float("speed", self.speed)
            .build()
    }
}

impl Render for TripDescriptor {
    fn render(&self) -> Value {
        Object::new()
            .opt("trip_id", self.trip_id.as_deref())
            .opt("route_id", self.route_id.as_deref())
            .opt("direction_id", self.direction_id)
            .opt("start_time", self.start_time.as_deref())
            .opt("start_date", self.start_date.as_deref())
            .opt_enum::<trip_descriptor::ScheduleRelationship>(
                "schedule_relationship",
                self.schedule_relationship,
            )
            .opt_message("modified_trip", &self.modified_trip)
            .build()
    }
}

impl Render for trip_descriptor::ModifiedTripSelector {
    fn render(&self) -> Value {
        Object::new()
            .opt("modifications_id", self.modifications_id.as_deref())
            .opt("affected_trip_id", self.affected_trip_id.as_deref())
            .opt("start_time", self.start_time.as_deref())
            .opt("start_date", self.start_date.as_deref())
            .build()
    }
}

impl Render for VehicleDescriptor {
    fn render(&self) -> Value {
        Object::new()
            .opt("id", self.id.as_deref())
            .opt("label", self.label.as_deref())
            .opt("license_plate", self.license_plate.as_deref())
            .opt_enum::<vehicle_descriptor::WheelchairAccessible>(
                "wheelchair_accessible",
                self.wheelchair_accessible,
            )
            .build()
    }
}

impl Render for EntitySelector {
    fn render(&self) -> Value {
        Object::new()
            .opt("agency_id", self.agency_id.as_deref())
            .opt("route_id", self.route_id.as_deref())
            .opt("route_type", self.route_type)
            .opt_message("trip", &self.trip)
            .opt("stop_id", self.stop_id.as_deref())
            .opt("direction_id", self.direction_id)
            .build()
    }
}

impl Render for TranslatedString {
    fn render(&self) -> Value {
        Object::new()
            .repeated("translation", &self.translation)
            .build()
    }
}

impl Render for translated_string::Translation {
    fn render(&self) -> Value {
        Object::new()
            .field("text", self.text.as_str())
            .opt("language", self.language.as_deref())
            .build()
    }
}

impl Render for TranslatedImage {
    fn render(&self) -> Value {
        Object::new()
            .repeated("localized_image", &self.localized_image)
            .build()
    }
}

impl Render for translated_image::LocalizedImage {
    fn render(&self) -> Value {
        Object::new()
            .field("url", self.url.as_str())
            .field("media_type", self.media_type.as_str())
            .opt("language", self.language.as_deref())
            .build()
    }
}

impl Render for Shape {
    fn render(&self) -> Value {
        Object::new()
            .opt("shape_id", self.shape_id.as_deref())
            .opt("encoded_polyline", self.encoded_polyline.as_deref())
            .build()
    }
}

impl Render for Stop {
    fn render(&self) -> Value {
        Object::new()
            .opt("stop_id", self.stop_id.as_deref())
            .opt_message("stop_code", &self.stop_code)
            .opt_message("stop_name", &self.stop_name)
            .opt_message("tts_stop_name", &self.tts_stop_name)
            .opt_message("stop_desc", &self.stop_desc)
            .opt_float("stop_lat", self.stop_lat)
            .opt_float("stop_lon", self.stop_lon)
            .opt("zone_id", self.zone_id.as_deref())
            .opt_message("stop_url", &self.stop_url)
            .opt("parent_station", self.parent_station.as_deref())
            .opt("stop_timezone", self.stop_timezone.as_deref())
            .opt_enum::<stop::WheelchairBoarding>("wheelchair_boarding", self.wheelchair_boarding)
            .opt("level_id", self.level_id.as_deref())
            .opt_message("platform_code", &self.platform_code)
            .build()
    }
}

impl Render for TripModifications {
    fn render(&self) -> Value {
        Object::new()
            .repeated("selected_trips", &self.selected_trips)
            .strings("start_times", &self.start_times)
            .strings("service_dates", &self.service_dates)
            .repeated("modifications", &self.modifications)
            .build()
    }
}

impl Render for trip_modifications::Modification {
    fn render(&self) -> Value {
        Object::new()
            .opt_message("start_stop_selector", &self.start_stop_selector)
            .opt_message("end_stop_selector", &self.end_stop_selector)
            .opt("propagated_modification_delay", self.propagated_modification_delay)
            .repeated("replacement_stops", &self.replacement_stops)
            .opt("service_alert_id", self.service_alert_id.as_deref())
            .opt_u64("last_modified_time", self.last_modified_time)
            .build()
    }
}

impl Render for trip_modifications::SelectedTrips {
    fn render(&self) -> Value {
        Object::new()
            .strings("trip_ids", &self.trip_ids)
            .opt("shape_id", self.shape_id.as_deref())
            .build()
    }
}

impl Render for StopSelector {
    fn render(&self) -> Value {
        Object::new()
            .opt("stop_sequence", self.stop_sequence)
            .opt("stop_id", self.stop_id.as_deref())
            .build()
    }
}

impl Render for ReplacementStop {
    fn render(&self) -> Value {
        Object::new()
            .opt("travel_time_to_stop", self.travel_time_to_stop)
            .opt("stop_id", self.stop_id.as_deref())
            .build()
    }
}
