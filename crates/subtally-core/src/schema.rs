//! Static column definitions for the six transaction kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transaction kind. Each kind has its own directory in the store and its
/// own raw source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Activation,
    Renewal,
    Deactivation,
    Cancellation,
    Refund,
    OneTimePurchase,
}

/// Physical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Text,
    DateTime,
    Date,
}

impl ColumnType {
    /// One-byte tag written into columnar file schema blocks.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Int => 0,
            Self::Float => 1,
            Self::Text => 2,
            Self::DateTime => 3,
            Self::Date => 4,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Int),
            1 => Some(Self::Float),
            2 => Some(Self::Text),
            3 => Some(Self::DateTime),
            4 => Some(Self::Date),
            _ => None,
        }
    }
}

/// Every column that appears in any transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Tmuserid,
    Msisdn,
    Cpc,
    TransTypeId,
    ChannelId,
    ChannelAct,
    ChannelDct,
    TransDate,
    ActDate,
    RenoDate,
    CampName,
    TefProv,
    CampanaMedium,
    CampanaId,
    SubscriptionId,
    Rev,
    CancelDate,
    SbnId,
    Mode,
    RefndDate,
    RfndAmount,
    RfndCnt,
    Sbnid,
    InstantRfnd,
}

impl Field {
    const ALL: [Self; 24] = [
        Self::Tmuserid,
        Self::Msisdn,
        Self::Cpc,
        Self::TransTypeId,
        Self::ChannelId,
        Self::ChannelAct,
        Self::ChannelDct,
        Self::TransDate,
        Self::ActDate,
        Self::RenoDate,
        Self::CampName,
        Self::TefProv,
        Self::CampanaMedium,
        Self::CampanaId,
        Self::SubscriptionId,
        Self::Rev,
        Self::CancelDate,
        Self::SbnId,
        Self::Mode,
        Self::RefndDate,
        Self::RfndAmount,
        Self::RfndCnt,
        Self::Sbnid,
        Self::InstantRfnd,
    ];

    /// Column name as it appears in raw headers and columnar files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tmuserid => "tmuserid",
            Self::Msisdn => "msisdn",
            Self::Cpc => "cpc",
            Self::TransTypeId => "trans_type_id",
            Self::ChannelId => "channel_id",
            Self::ChannelAct => "channel_act",
            Self::ChannelDct => "channel_dct",
            Self::TransDate => "trans_date",
            Self::ActDate => "act_date",
            Self::RenoDate => "reno_date",
            Self::CampName => "camp_name",
            Self::TefProv => "tef_prov",
            Self::CampanaMedium => "campana_medium",
            Self::CampanaId => "campana_id",
            Self::SubscriptionId => "subscription_id",
            Self::Rev => "rev",
            Self::CancelDate => "cancel_date",
            Self::SbnId => "sbn_id",
            Self::Mode => "mode",
            Self::RefndDate => "refnd_date",
            Self::RfndAmount => "rfnd_amount",
            Self::RfndCnt => "rfnd_cnt",
            Self::Sbnid => "sbnid",
            Self::InstantRfnd => "instant_rfnd",
        }
    }

    #[must_use]
    pub const fn column_type(self) -> ColumnType {
        match self {
            Self::Cpc
            | Self::TransTypeId
            | Self::ChannelId
            | Self::TefProv
            | Self::SubscriptionId
            | Self::SbnId
            | Self::RfndCnt
            | Self::Sbnid => ColumnType::Int,
            Self::Rev | Self::RfndAmount => ColumnType::Float,
            Self::TransDate
            | Self::ActDate
            | Self::RenoDate
            | Self::CancelDate
            | Self::RefndDate => ColumnType::DateTime,
            Self::Tmuserid
            | Self::Msisdn
            | Self::ChannelAct
            | Self::ChannelDct
            | Self::CampName
            | Self::CampanaMedium
            | Self::CampanaId
            | Self::Mode
            | Self::InstantRfnd => ColumnType::Text,
        }
    }

    /// Case-insensitive lookup by column name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const ACT_RENO_FIELDS: &[Field] = &[
    Field::Tmuserid,
    Field::Msisdn,
    Field::Cpc,
    Field::TransTypeId,
    Field::ChannelId,
    Field::ChannelAct,
    Field::TransDate,
    Field::ActDate,
    Field::RenoDate,
    Field::CampName,
    Field::TefProv,
    Field::CampanaMedium,
    Field::CampanaId,
    Field::SubscriptionId,
    Field::Rev,
];

const DCT_FIELDS: &[Field] = &[
    Field::Tmuserid,
    Field::Msisdn,
    Field::Cpc,
    Field::TransTypeId,
    Field::ChannelDct,
    Field::TransDate,
    Field::ActDate,
    Field::RenoDate,
    Field::CampName,
    Field::TefProv,
    Field::CampanaMedium,
    Field::CampanaId,
    Field::SubscriptionId,
];

const PPD_FIELDS: &[Field] = &[
    Field::Tmuserid,
    Field::Msisdn,
    Field::Cpc,
    Field::TransTypeId,
    Field::ChannelId,
    Field::TransDate,
    Field::ActDate,
    Field::RenoDate,
    Field::CampName,
    Field::TefProv,
    Field::CampanaMedium,
    Field::CampanaId,
    Field::SubscriptionId,
    Field::Rev,
];

const CNR_FIELDS: &[Field] = &[
    Field::CancelDate,
    Field::SbnId,
    Field::Tmuserid,
    Field::Cpc,
    Field::Mode,
];

const RFND_FIELDS: &[Field] = &[
    Field::Tmuserid,
    Field::Cpc,
    Field::RefndDate,
    Field::RfndAmount,
    Field::RfndCnt,
    Field::Sbnid,
    Field::InstantRfnd,
];

impl Kind {
    pub const ALL: [Self; 6] = [
        Self::Activation,
        Self::Renewal,
        Self::Deactivation,
        Self::Cancellation,
        Self::Refund,
        Self::OneTimePurchase,
    ];

    /// Short name, used as the store directory and in counter column names.
    #[must_use]
    pub const fn dir(self) -> &'static str {
        match self {
            Self::Activation => "act",
            Self::Renewal => "reno",
            Self::Deactivation => "dct",
            Self::Cancellation => "cnr",
            Self::Refund => "rfnd",
            Self::OneTimePurchase => "ppd",
        }
    }

    /// Ordered column list for this kind.
    #[must_use]
    pub const fn fields(self) -> &'static [Field] {
        match self {
            Self::Activation | Self::Renewal => ACT_RENO_FIELDS,
            Self::Deactivation => DCT_FIELDS,
            Self::OneTimePurchase => PPD_FIELDS,
            Self::Cancellation => CNR_FIELDS,
            Self::Refund => RFND_FIELDS,
        }
    }

    /// The column that decides a record's partition. Never null in the store.
    #[must_use]
    pub const fn primary_date(self) -> Field {
        match self {
            Self::Activation | Self::Renewal | Self::Deactivation | Self::OneTimePurchase => {
                Field::TransDate
            }
            Self::Cancellation => Field::CancelDate,
            Self::Refund => Field::RefndDate,
        }
    }

    /// Fields whose values together identify one logical event.
    #[must_use]
    pub const fn natural_key(self) -> &'static [Field] {
        match self {
            Self::Activation | Self::Renewal | Self::Deactivation | Self::OneTimePurchase => {
                &[Field::SubscriptionId, Field::TransDate, Field::TransTypeId]
            }
            Self::Cancellation => &[Field::SbnId, Field::CancelDate],
            Self::Refund => &[Field::Sbnid, Field::RefndDate],
        }
    }

    /// Channel column inspected for the upgrade split, if the kind has one.
    #[must_use]
    pub const fn channel_field(self) -> Option<Field> {
        match self {
            Self::Activation | Self::Renewal => Some(Field::ChannelAct),
            Self::Deactivation => Some(Field::ChannelDct),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_field(self, field: Field) -> bool {
        self.fields().contains(&field)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// Error returned when a kind name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transaction kind '{0}': expected one of act, reno, dct, cnr, rfnd, ppd")]
pub struct UnknownKind(pub String);

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "act" | "activation" => Ok(Self::Activation),
            "reno" | "renewal" => Ok(Self::Renewal),
            "dct" | "deactivation" => Ok(Self::Deactivation),
            "cnr" | "cancellation" => Ok(Self::Cancellation),
            "rfnd" | "refund" => Ok(Self::Refund),
            "ppd" | "one_time_purchase" | "one-time-purchase" => Ok(Self::OneTimePurchase),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}
