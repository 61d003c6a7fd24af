use crate::error::WriteError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Property key of the reserved namespace block.
pub const NAMESPACE_KEY: &str = "@ns:com:here:xyz";

pub type Position = Vec<f64>;

/// GeoJSON geometry. Positions are `[x, y]` or `[x, y, z]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::LineString(_) => "LineString",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    pub fn for_each_position_mut(&mut self, mut f: impl FnMut(&mut Position)) {
        match self {
            Geometry::Point(p) => f(p),
            Geometry::MultiPoint(ps) | Geometry::LineString(ps) => ps.iter_mut().for_each(f),
            Geometry::MultiLineString(lines) | Geometry::Polygon(lines) => {
                lines.iter_mut().flatten().for_each(f)
            }
            Geometry::MultiPolygon(polys) => polys.iter_mut().flatten().flatten().for_each(f),
        }
    }

    /// Returns a copy fit for binding: a NaN z becomes 0, anything else that
    /// is not a finite 2D/3D position is rejected.
    pub fn sanitized(&self) -> Result<Geometry, WriteError> {
        let mut out = self.clone();
        let mut invalid = None;
        out.for_each_position_mut(|pos| {
            if invalid.is_some() {
                return;
            }
            if !(2..=3).contains(&pos.len()) {
                invalid = Some(format!("position with {} ordinates", pos.len()));
                return;
            }
            if let Some(z) = pos.get_mut(2)
                && z.is_nan()
            {
                *z = 0.0;
            }
            if pos.iter().any(|v| !v.is_finite()) {
                invalid = Some(format!("non-finite ordinate in {pos:?}"));
            }
        });
        match invalid {
            Some(reason) => Err(WriteError::IllegalArgument(format!(
                "invalid {} geometry: {reason}",
                self.type_name()
            ))),
            None => Ok(out),
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Reserved per-feature metadata maintained by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub puuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "@ns:com:here:xyz", default)]
    pub namespace: Namespace,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Properties,
}

impl Feature {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn without_id() -> Self {
        Self::default()
    }

    /// A feature that only marks `id` as deleted in an extension layer.
    pub fn tombstone(id: impl Into<String>, puuid: Option<String>) -> Self {
        let mut feature = Self::new(id);
        feature.properties.namespace.deleted = true;
        feature.properties.namespace.puuid = puuid;
        feature
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.values.insert(key.into(), value.into());
        self
    }

    pub fn with_puuid(mut self, puuid: impl Into<String>) -> Self {
        self.properties.namespace.puuid = Some(puuid.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn puuid(&self) -> Option<&str> {
        self.properties.namespace.puuid.as_deref()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.properties.namespace
    }

    pub fn is_tombstone(&self) -> bool {
        self.properties.namespace.deleted
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry.is_some()
    }

    /// The json column value: the feature without its geometry, stamped with
    /// `version` when one was allocated.
    pub fn to_jsondata(&self, version: Option<i64>) -> Result<Value, WriteError> {
        let mut body = Feature {
            id: self.id.clone(),
            geometry: None,
            properties: self.properties.clone(),
        };
        if version.is_some() {
            body.properties.namespace.version = version;
        }
        let mut value = serde_json::to_value(&body)
            .map_err(|e| WriteError::IllegalArgument(format!("feature not serializable: {e}")))?;
        if let Value::Object(map) = &mut value {
            map.remove("geometry");
            map.insert("type".into(), Value::String("Feature".into()));
        }
        Ok(value)
    }

    /// Rebuilds a feature from its stored columns.
    pub fn from_columns(
        id: &str,
        jsondata: &Value,
        geometry: Option<Geometry>,
    ) -> Result<Self, serde_json::Error> {
        let properties = match jsondata.get("properties") {
            Some(props) => serde_json::from_value(props.clone())?,
            None => Properties::default(),
        };
        Ok(Self {
            id: Some(id.to_string()),
            geometry,
            properties,
        })
    }

    /// Replaces the namespace block with the one reported by the store.
    pub fn apply_namespace_json(&mut self, raw: &str) -> Result<(), serde_json::Error> {
        self.properties.namespace = serde_json::from_str(raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Feature, Geometry, NAMESPACE_KEY};
    use serde_json::json;

    #[test]
    fn jsondata_excludes_geometry_and_carries_version() {
        let feature = Feature::new("f1")
            .with_geometry(Geometry::Point(vec![1.0, 2.0]))
            .with_property("name", "river");
        let json = feature.to_jsondata(Some(7)).expect("jsondata");
        assert!(json.get("geometry").is_none());
        assert_eq!(json["id"], json!("f1"));
        assert_eq!(json["type"], json!("Feature"));
        assert_eq!(json["properties"]["name"], json!("river"));
        assert_eq!(json["properties"][NAMESPACE_KEY]["version"], json!(7));
    }

    #[test]
    fn sanitize_zeroes_nan_elevation() {
        let geometry = Geometry::LineString(vec![vec![1.0, 2.0, f64::NAN], vec![3.0, 4.0]]);
        let clean = geometry.sanitized().expect("sanitized");
        assert_eq!(
            clean,
            Geometry::LineString(vec![vec![1.0, 2.0, 0.0], vec![3.0, 4.0]])
        );
    }

    #[test]
    fn sanitize_rejects_non_finite_planar_ordinates() {
        let geometry = Geometry::Point(vec![f64::INFINITY, 2.0]);
        assert!(geometry.sanitized().is_err());
        let geometry = Geometry::Point(vec![1.0]);
        assert!(geometry.sanitized().is_err());
    }

    #[test]
    fn columns_round_trip_namespace() {
        let stored = json!({
            "id": "f1",
            "type": "Feature",
            "properties": {
                "name": "lake",
                NAMESPACE_KEY: {"uuid": "u1", "version": 3, "createdAt": 10, "updatedAt": 12}
            }
        });
        let feature = Feature::from_columns("f1", &stored, None).expect("feature");
        assert_eq!(feature.namespace().uuid.as_deref(), Some("u1"));
        assert_eq!(feature.namespace().version, Some(3));
        assert_eq!(feature.properties.values["name"], json!("lake"));
    }

    #[test]
    fn tombstones_are_flagged_deleted() {
        let tomb = Feature::tombstone("f9", Some("p".into()));
        assert!(tomb.is_tombstone());
        assert_eq!(tomb.puuid(), Some("p"));
        assert!(!tomb.has_geometry());
    }
}
