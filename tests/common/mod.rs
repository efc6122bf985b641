//! Shared fixture domain for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use unitwork::{
    CommitMode, Entity, ObjectId, ObjectStore, PlainValue, Property, Result, StoreConfig,
    TypeRegistry, Value,
};

#[derive(Debug, Clone, PartialEq)]
pub struct City {
    pub id: ObjectId,
    pub name: String,
    pub population: i64,
    pub weather: Option<ObjectId>,
    pub districts: Vec<ObjectId>,
    /// Not tracked and never persisted.
    pub lookups: i64,
}

impl City {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::with_id(ObjectId::new())
        }
    }
}

impl Entity for City {
    const TYPE_NAME: &'static str = "geo.City";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn with_id(id: ObjectId) -> Self {
        Self {
            id,
            name: String::new(),
            population: 0,
            weather: None,
            districts: Vec::new(),
            lookups: 0,
        }
    }

    fn properties() -> Vec<Property<Self>> {
        vec![
            Property::plain(
                "name",
                |c: &City| c.name.clone().into_value(),
                |c: &mut City, v: Value| -> Result<()> {
                    c.name = String::from_value(v)?;
                    Ok(())
                },
            ),
            Property::plain(
                "population",
                |c: &City| c.population.into_value(),
                |c: &mut City, v: Value| -> Result<()> {
                    c.population = i64::from_value(v)?;
                    Ok(())
                },
            ),
            Property::reference("weather", |c: &City| c.weather, |c: &mut City, v| c.weather = v),
            Property::association(
                "districts",
                |c: &City| &c.districts,
                |c: &mut City| &mut c.districts,
            ),
            Property::plain(
                "lookups",
                |c: &City| c.lookups.into_value(),
                |c: &mut City, v: Value| -> Result<()> {
                    c.lookups = i64::from_value(v)?;
                    Ok(())
                },
            )
            .untracked(),
        ]
    }
}

/// Observations are immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Weather {
    pub id: ObjectId,
    pub summary: String,
    pub temperature: f64,
}

impl Weather {
    pub fn new(summary: &str, temperature: f64) -> Self {
        Self {
            id: ObjectId::new(),
            summary: summary.to_string(),
            temperature,
        }
    }
}

impl Entity for Weather {
    const TYPE_NAME: &'static str = "geo.Weather";
    const UPDATABLE: bool = false;

    fn id(&self) -> ObjectId {
        self.id
    }

    fn with_id(id: ObjectId) -> Self {
        Self {
            id,
            summary: String::new(),
            temperature: 0.0,
        }
    }

    fn properties() -> Vec<Property<Self>> {
        vec![
            Property::plain(
                "summary",
                |w: &Weather| w.summary.clone().into_value(),
                |w: &mut Weather, v: Value| -> Result<()> {
                    w.summary = String::from_value(v)?;
                    Ok(())
                },
            ),
            Property::plain(
                "temperature",
                |w: &Weather| w.temperature.into_value(),
                |w: &mut Weather, v: Value| -> Result<()> {
                    w.temperature = f64::from_value(v)?;
                    Ok(())
                },
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct District {
    pub id: ObjectId,
    pub name: String,
    /// Back edge to the owning city.
    pub city: Option<ObjectId>,
    pub neighbours: Vec<ObjectId>,
}

impl District {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::with_id(ObjectId::new())
        }
    }
}

impl Entity for District {
    const TYPE_NAME: &'static str = "geo.District";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn with_id(id: ObjectId) -> Self {
        Self {
            id,
            name: String::new(),
            city: None,
            neighbours: Vec::new(),
        }
    }

    fn properties() -> Vec<Property<Self>> {
        vec![
            Property::plain(
                "name",
                |d: &District| d.name.clone().into_value(),
                |d: &mut District, v: Value| -> Result<()> {
                    d.name = String::from_value(v)?;
                    Ok(())
                },
            ),
            Property::reference("city", |d: &District| d.city, |d: &mut District, v| d.city = v),
            Property::association(
                "neighbours",
                |d: &District| &d.neighbours,
                |d: &mut District| &mut d.neighbours,
            ),
        ]
    }
}

pub fn registry() -> TypeRegistry {
    TypeRegistry::builder()
        .register::<City>(1)
        .register::<Weather>(2)
        .register::<District>(3)
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_config(dir: &TempDir, commit_mode: CommitMode) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        create_if_missing: true,
        record_cache_size: 100,
        commit_mode,
    }
}

pub fn test_store(dir: &TempDir) -> Arc<ObjectStore> {
    init_tracing();
    Arc::new(ObjectStore::create(test_config(dir, CommitMode::Direct), registry()).unwrap())
}

pub fn reopen(dir: &TempDir, commit_mode: CommitMode) -> Arc<ObjectStore> {
    Arc::new(ObjectStore::open(test_config(dir, commit_mode), registry()).unwrap())
}

/// A city with weather and two districts that point back at it.
pub struct Oslo {
    pub city: ObjectId,
    pub weather: ObjectId,
    pub grunerlokka: ObjectId,
    pub frogner: ObjectId,
}

pub fn build_oslo(store: &ObjectStore) -> Oslo {
    let weather = store.insert(Weather::new("rain", 7.5)).unwrap();

    let mut city = City::new("Oslo");
    city.population = 709_000;
    city.weather = Some(weather);
    let city_id = city.id;

    let mut grunerlokka = District::new("Grunerlokka");
    let mut frogner = District::new("Frogner");
    grunerlokka.city = Some(city_id);
    frogner.city = Some(city_id);
    grunerlokka.neighbours = vec![frogner.id];
    frogner.neighbours = vec![grunerlokka.id];
    city.districts = vec![grunerlokka.id, frogner.id];

    // Districts point back at the city, so it goes in first.
    let districts = [grunerlokka.id, frogner.id];
    store.insert(city).unwrap();
    store.insert(grunerlokka).unwrap();
    store.insert(frogner).unwrap();

    Oslo {
        city: city_id,
        weather,
        grunerlokka: districts[0],
        frogner: districts[1],
    }
}
