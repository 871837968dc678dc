//! Builds the mock property-management database used for demos and tests.

use chrono::{Duration, NaiveDate, Utc};
use duckdb::{params, Connection};
use r2d2::ManageConnection;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::path::Path;
use tracing::info;

use super::db_pool::DuckDBConnectionManager;

const DEFAULT_SEED: u64 = 20_240_611;

const CITIES: &[(&str, &str)] = &[
    ("Philadelphia", "PA"),
    ("Phoenix", "AZ"),
    ("Los Angeles", "CA"),
    ("Chicago", "IL"),
    ("Houston", "TX"),
    ("Miami", "FL"),
    ("Seattle", "WA"),
];
const STREETS: &[&str] = &["Main", "Oak", "Elm", "Maple", "Park"];
const PROPERTY_TYPES: &[&str] = &["Single Family", "Multi-Family", "Commercial"];
const LLC2_RENTS: [f64; 12] = [
    950.0, 1000.0, 1050.0, 1100.0, 980.0, 1020.0, 1015.0, 1030.0, 990.0, 1025.0, 1040.0, 996.0,
];

const SCHEMA_DDL: &str = "
CREATE TABLE Owners (
    owner_id INTEGER PRIMARY KEY,
    owner_name VARCHAR NOT NULL,
    contact_email VARCHAR,
    contact_phone VARCHAR
);
CREATE TABLE Properties (
    property_id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL REFERENCES Owners(owner_id),
    address VARCHAR NOT NULL,
    city VARCHAR NOT NULL,
    state VARCHAR NOT NULL,
    zip_code VARCHAR NOT NULL,
    property_type VARCHAR NOT NULL,
    purchase_date VARCHAR NOT NULL,
    purchase_price DOUBLE NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE Units (
    unit_id INTEGER PRIMARY KEY,
    property_id INTEGER NOT NULL REFERENCES Properties(property_id),
    unit_number VARCHAR NOT NULL,
    bedrooms INTEGER NOT NULL,
    bathrooms DOUBLE NOT NULL,
    square_feet INTEGER NOT NULL,
    monthly_rent DOUBLE NOT NULL
);
CREATE TABLE Leases (
    lease_id INTEGER PRIMARY KEY,
    unit_id INTEGER NOT NULL REFERENCES Units(unit_id),
    tenant_name VARCHAR NOT NULL,
    start_date VARCHAR NOT NULL,
    end_date VARCHAR NOT NULL,
    monthly_rent DOUBLE NOT NULL,
    security_deposit DOUBLE NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);
";

#[derive(Debug)]
pub enum SeedError {
    AlreadyExists(String),
    Io(std::io::Error),
    Database(duckdb::Error),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedError::AlreadyExists(path) => {
                write!(f, "Database already exists at {} (use --force to replace it)", path)
            }
            SeedError::Io(e) => write!(f, "I/O error while seeding: {}", e),
            SeedError::Database(e) => write!(f, "Database error while seeding: {}", e),
        }
    }
}

impl Error for SeedError {}

impl From<duckdb::Error> for SeedError {
    fn from(e: duckdb::Error) -> Self {
        SeedError::Database(e)
    }
}

impl From<std::io::Error> for SeedError {
    fn from(e: std::io::Error) -> Self {
        SeedError::Io(e)
    }
}

struct OwnerRow {
    id: i64,
    name: &'static str,
    email: &'static str,
    phone: &'static str,
}

struct PropertyRow {
    id: i64,
    owner_id: i64,
    address: String,
    city: String,
    state: String,
    zip_code: String,
    property_type: String,
    purchase_date: String,
    purchase_price: f64,
    is_active: i32,
}

struct UnitRow {
    id: i64,
    property_id: i64,
    unit_number: String,
    bedrooms: i32,
    bathrooms: f64,
    square_feet: i32,
    monthly_rent: f64,
}

struct LeaseRow {
    id: i64,
    unit_id: i64,
    tenant_name: String,
    start_date: String,
    end_date: String,
    monthly_rent: f64,
    security_deposit: f64,
    is_active: i32,
}

/// Row counts written by a seeding run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedSummary {
    pub owners: usize,
    pub properties: usize,
    pub active_properties: usize,
    pub units: usize,
    pub leases: usize,
}

struct MockData {
    owners: Vec<OwnerRow>,
    properties: Vec<PropertyRow>,
    units: Vec<UnitRow>,
    leases: Vec<LeaseRow>,
}

fn owners() -> Vec<OwnerRow> {
    vec![
        OwnerRow { id: 1, name: "LLC1", email: "contact@llc1.com", phone: "555-0101" },
        OwnerRow { id: 2, name: "LLC2", email: "contact@llc2.com", phone: "555-0102" },
        OwnerRow { id: 3, name: "LLC3", email: "contact@llc3.com", phone: "555-0103" },
        OwnerRow { id: 4, name: "LLC4", email: "contact@llc4.com", phone: "555-0104" },
        OwnerRow { id: 5, name: "LLC5", email: "contact@llc5.com", phone: "555-0105" },
        OwnerRow { id: 6, name: "Other Holdings LLC", email: "contact@other.com", phone: "555-0106" },
    ]
}

fn random_properties(
    rng: &mut StdRng,
    owner_id: i64,
    count: usize,
    active: usize,
    first_id: i64,
) -> Vec<PropertyRow> {
    (0..count)
        .map(|i| {
            let (city, _) = CITIES.choose(rng).copied().unwrap_or(CITIES[0]);
            let (_, state) = CITIES.choose(rng).copied().unwrap_or(CITIES[0]);
            let street = STREETS.choose(rng).copied().unwrap_or(STREETS[0]);
            let property_type = PROPERTY_TYPES.choose(rng).copied().unwrap_or(PROPERTY_TYPES[0]);
            PropertyRow {
                id: first_id + i as i64,
                owner_id,
                address: format!("{} {} St", rng.gen_range(100..=9999), street),
                city: city.to_string(),
                state: state.to_string(),
                zip_code: rng.gen_range(10000..=99999).to_string(),
                property_type: property_type.to_string(),
                purchase_date: format!(
                    "20{}-{:02}-{:02}",
                    rng.gen_range(15..=23),
                    rng.gen_range(1..=12),
                    rng.gen_range(1..=28)
                ),
                purchase_price: (rng.gen_range(150_000.0..800_000.0_f64) * 100.0).round() / 100.0,
                is_active: i32::from(i < active),
            }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn landmark(
    id: i64,
    owner_id: i64,
    address: &str,
    city: &str,
    state: &str,
    zip_code: &str,
    property_type: &str,
    purchase_date: &str,
    purchase_price: f64,
) -> PropertyRow {
    PropertyRow {
        id,
        owner_id,
        address: address.to_string(),
        city: city.to_string(),
        state: state.to_string(),
        zip_code: zip_code.to_string(),
        property_type: property_type.to_string(),
        purchase_date: purchase_date.to_string(),
        purchase_price,
        is_active: 1,
    }
}

fn generate(seed: u64, today: NaiveDate) -> MockData {
    let mut rng = StdRng::seed_from_u64(seed);

    // (owner, total, active): 161 properties, 115 active
    let distribution: [(i64, usize, usize); 6] =
        [(1, 22, 16), (2, 12, 10), (3, 50, 41), (4, 20, 14), (5, 30, 20), (6, 27, 14)];

    let mut properties = Vec::new();
    let mut first_ids = Vec::new();
    let mut next_id = 1;
    for (owner_id, total, active) in distribution {
        first_ids.push(next_id);
        let mut batch = random_properties(&mut rng, owner_id, total, active, next_id);
        match owner_id {
            5 => {
                batch[0] = landmark(
                    next_id, 5, "5678 Eshelman Mill Rd", "Willow Street", "PA", "17584",
                    "Single Family", "2019-03-20", 175_000.0,
                )
            }
            6 => {
                batch[0] = landmark(
                    next_id, 6, "1234 W Yucca St", "Glendale", "AZ", "85301", "Multi-Family",
                    "2018-06-15", 180_000.0,
                )
            }
            _ => {}
        }
        properties.extend(batch);
        next_id += total as i64;
    }

    let llc2_first = first_ids[1];
    let eshelman_id = first_ids[4];
    let yucca_id = first_ids[5];

    let mut units = Vec::new();
    let mut push_unit = |rng: &mut StdRng, property_id: i64, label: String, rent: f64, fixed: Option<(i32, f64, i32)>| {
        let (bedrooms, bathrooms, square_feet) = fixed.unwrap_or_else(|| {
            (
                rng.gen_range(1..=3),
                [1.0, 1.5, 2.0].choose(rng).copied().unwrap_or(1.0),
                rng.gen_range(600..=1200),
            )
        });
        units.push(UnitRow {
            id: units.len() as i64 + 1,
            property_id,
            unit_number: label,
            bedrooms,
            bathrooms,
            square_feet,
            monthly_rent: rent,
        });
    };

    for (i, rent) in LLC2_RENTS.iter().enumerate() {
        push_unit(&mut rng, llc2_first + i as i64, "Unit A".to_string(), *rent, None);
    }
    for i in 0..4u8 {
        push_unit(&mut rng, yucca_id, format!("Unit {}", (b'A' + i) as char), 3500.0, Some((3, 2.0, 1200)));
    }
    for i in 0..3u8 {
        let label = if i == 0 { "Unit X".to_string() } else { format!("Unit {}", (b'A' + i) as char) };
        push_unit(&mut rng, eshelman_id, label, 3200.0, Some((3, 2.0, 1100)));
    }

    let llc2_ids = llc2_first..llc2_first + LLC2_RENTS.len() as i64;
    let remaining: Vec<i64> = properties
        .iter()
        .map(|p| p.id)
        .filter(|id| !llc2_ids.contains(id) && *id != yucca_id && *id != eshelman_id)
        .collect();
    for property_id in remaining {
        let rent = (850 + rng.gen_range(-150..=150)).max(600) as f64;
        push_unit(&mut rng, property_id, "Unit A".to_string(), rent, None);
    }

    let leases = units
        .iter()
        .enumerate()
        .map(|(i, unit)| {
            let start = today - Duration::days(rng.gen_range(30..=365));
            let end = start + Duration::days(365);
            LeaseRow {
                id: i as i64 + 1,
                unit_id: unit.id,
                tenant_name: format!("Tenant {}", i + 1),
                start_date: start.format("%Y-%m-%d").to_string(),
                end_date: end.format("%Y-%m-%d").to_string(),
                monthly_rent: unit.monthly_rent,
                security_deposit: unit.monthly_rent * 1.5,
                is_active: i32::from(end > today),
            }
        })
        .collect();

    MockData {
        owners: owners(),
        properties,
        units,
        leases,
    }
}

fn write(conn: &mut Connection, data: &MockData) -> Result<(), duckdb::Error> {
    conn.execute_batch(SCHEMA_DDL)?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare("INSERT INTO Owners VALUES (?, ?, ?, ?)")?;
        for o in &data.owners {
            stmt.execute(params![o.id, o.name, o.email, o.phone])?;
        }

        let mut stmt = tx.prepare("INSERT INTO Properties VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")?;
        for p in &data.properties {
            stmt.execute(params![
                p.id, p.owner_id, p.address, p.city, p.state, p.zip_code, p.property_type,
                p.purchase_date, p.purchase_price, p.is_active
            ])?;
        }

        let mut stmt = tx.prepare("INSERT INTO Units VALUES (?, ?, ?, ?, ?, ?, ?)")?;
        for u in &data.units {
            stmt.execute(params![
                u.id, u.property_id, u.unit_number, u.bedrooms, u.bathrooms, u.square_feet, u.monthly_rent
            ])?;
        }

        let mut stmt = tx.prepare("INSERT INTO Leases VALUES (?, ?, ?, ?, ?, ?, ?, ?)")?;
        for l in &data.leases {
            stmt.execute(params![
                l.id, l.unit_id, l.tenant_name, l.start_date, l.end_date, l.monthly_rent,
                l.security_deposit, l.is_active
            ])?;
        }
    }
    tx.commit()
}

/// Creates the mock database at `path`.
pub fn seed_database(path: &str, force: bool) -> Result<SeedSummary, SeedError> {
    seed_with(path, force, DEFAULT_SEED)
}

fn seed_with(path: &str, force: bool, seed: u64) -> Result<SeedSummary, SeedError> {
    let db_path = Path::new(path);
    if db_path.exists() {
        if !force {
            return Err(SeedError::AlreadyExists(path.to_string()));
        }
        std::fs::remove_file(db_path)?;
        let wal = format!("{}.wal", path);
        if Path::new(&wal).exists() {
            std::fs::remove_file(wal)?;
        }
        info!("Removed existing database: {}", path);
    }
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let data = generate(seed, Utc::now().date_naive());
    let mut conn = DuckDBConnectionManager::read_write(path.to_string()).connect()?;
    write(&mut conn, &data)?;

    let summary = SeedSummary {
        owners: data.owners.len(),
        properties: data.properties.len(),
        active_properties: data.properties.iter().filter(|p| p.is_active == 1).count(),
        units: data.units.len(),
        leases: data.leases.len(),
    };
    info!(
        "Seeded {} owners, {} properties ({} active), {} units, {} leases into {}",
        summary.owners, summary.properties, summary.active_properties, summary.units, summary.leases, path
    );
    Ok(summary)
}
