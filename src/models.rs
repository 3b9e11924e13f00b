// src/models.rs - Domain entities and request/response DTOs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

// ==================== BLOOD GROUP ====================

pub const BLOOD_GROUPS: [&str; 8] = ["A+", "A-", "B+", "B-", "AB+", "AB-", "O+", "O-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloodGroup {
    APos,
    ANeg,
    BPos,
    BNeg,
    AbPos,
    AbNeg,
    OPos,
    ONeg,
}

impl BloodGroup {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "A+" => Some(BloodGroup::APos),
            "A-" => Some(BloodGroup::ANeg),
            "B+" => Some(BloodGroup::BPos),
            "B-" => Some(BloodGroup::BNeg),
            "AB+" => Some(BloodGroup::AbPos),
            "AB-" => Some(BloodGroup::AbNeg),
            "O+" => Some(BloodGroup::OPos),
            "O-" => Some(BloodGroup::ONeg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BloodGroup::APos => "A+",
            BloodGroup::ANeg => "A-",
            BloodGroup::BPos => "B+",
            BloodGroup::BNeg => "B-",
            BloodGroup::AbPos => "AB+",
            BloodGroup::AbNeg => "AB-",
            BloodGroup::OPos => "O+",
            BloodGroup::ONeg => "O-",
        }
    }

    pub fn is_valid(s: &str) -> bool {
        Self::from_str(s).is_some()
    }

    /// Groups whose donors are broadcast a request for `self`: the exact
    /// group plus O- (universal donor). O- requests broadcast to O- only.
    pub fn compatible_donor_groups(&self) -> Vec<&'static str> {
        let mut groups = vec![self.as_str()];
        if *self != BloodGroup::ONeg {
            groups.push("O-");
        }
        groups
    }
}

impl std::fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==================== COMPONENT TYPE ====================

pub const COMPONENT_TYPES: [&str; 4] = ["Whole Blood", "Packed Red Cells", "Platelets", "Plasma"];

pub fn is_valid_component_type(s: &str) -> bool {
    COMPONENT_TYPES.contains(&s)
}

// ==================== UNIT STATUS ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Available,
    Reserved,
    Dispatched,
}

impl UnitStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Available" => Some(UnitStatus::Available),
            "Reserved" => Some(UnitStatus::Reserved),
            "Dispatched" => Some(UnitStatus::Dispatched),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "Available",
            UnitStatus::Reserved => "Reserved",
            UnitStatus::Dispatched => "Dispatched",
        }
    }
}

// ==================== REQUEST STATUS ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Dispatched,
    Fulfilled,
}

impl RequestStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(RequestStatus::Pending),
            "Approved" => Some(RequestStatus::Approved),
            "Dispatched" => Some(RequestStatus::Dispatched),
            "Fulfilled" => Some(RequestStatus::Fulfilled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Approved => "Approved",
            RequestStatus::Dispatched => "Dispatched",
            RequestStatus::Fulfilled => "Fulfilled",
        }
    }

    /// Lifecycle: Pending -> Approved -> Dispatched, Pending -> Fulfilled.
    /// Dispatched and Fulfilled are terminal.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Approved)
                | (RequestStatus::Pending, RequestStatus::Fulfilled)
                | (RequestStatus::Approved, RequestStatus::Dispatched)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Dispatched | RequestStatus::Fulfilled)
    }
}

// ==================== URGENCY ====================

pub const URGENCY_LEVELS: [&str; 3] = ["Standard", "Urgent", "Critical"];

pub fn is_valid_urgency(s: &str) -> bool {
    URGENCY_LEVELS.contains(&s)
}

// ==================== INVENTORY UNIT ====================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InventoryUnit {
    pub id: String,
    pub isbt_id: String,
    pub blood_group: String,
    pub component_type: String,
    pub collection_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    pub status: String,
    pub institution_id: String,
    pub created_at: DateTime<Utc>,
}

impl InventoryUnit {
    /// Expiring-soon window: Available and expiry within `days` of `now`,
    /// inclusive. Already expired units do not count.
    pub fn expires_within(&self, now: DateTime<Utc>, days: i64) -> bool {
        self.status == UnitStatus::Available.as_str()
            && self.expiry_date >= now
            && self.expiry_date <= now + Duration::days(days)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddUnitsRequest {
    #[validate(length(min = 1, message = "Blood group is required"))]
    pub blood_group: String,
    #[serde(default = "default_component_type")]
    pub component_type: String,
    #[validate(range(min = 1, max = 100, message = "Quantity must be between 1 and 100"))]
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub collection_date: Option<DateTime<Utc>>,
}

fn default_component_type() -> String {
    "Whole Blood".to_string()
}

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct InventoryStats {
    pub total_available: i64,
    pub reserved: i64,
    pub expiring_soon: i64,
    pub available_by_group: Vec<GroupCount>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct GroupCount {
    pub blood_group: String,
    pub count: i64,
}

// ==================== BLOOD REQUEST ====================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BloodRequest {
    pub id: String,
    pub requester_id: String,
    pub requester_name: String,
    pub blood_group: String,
    pub units_needed: i64,
    pub urgency: String,
    pub hospital_name: Option<String>,
    pub status: String,
    pub fulfilled_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A request together with its donor broadcast list, the shape the
/// dashboards consume.
#[derive(Debug, Serialize)]
pub struct BloodRequestWithBroadcasts {
    #[serde(flatten)]
    pub request: BloodRequest,
    pub broadcasted_to: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRequestBody {
    #[validate(length(min = 1, message = "Blood group is required"))]
    pub blood_group: String,
    #[validate(range(min = 1, max = 50, message = "Units must be between 1 and 50"))]
    pub units: i64,
    #[validate(length(max = 255, message = "Hospital name cannot exceed 255 characters"))]
    pub hospital: Option<String>,
    #[serde(default = "default_urgency")]
    pub urgency: String,
}

fn default_urgency() -> String {
    "Standard".to_string()
}
