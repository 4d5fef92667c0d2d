//! Typed transaction records.
//!
//! [`TransactionRecord`] is a closed enum with one variant per [`Kind`].
//! Activation, renewal, deactivation and one-time-purchase rows share the
//! [`SubscriptionTx`] shape; columns a kind does not carry stay `None`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::schema::{Field, Kind};

/// A single dynamically typed cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(v) => Some(*v),
            Self::Date(d) => Some(d.and_time(chrono::NaiveTime::MIN)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::DateTime(v) => Some(v.date()),
            _ => None,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Self::Null, Self::Int)
    }
}

impl From<Option<f64>> for Value {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Self::Null, Self::Float)
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Self::Null, Self::Text)
    }
}

impl From<Option<NaiveDateTime>> for Value {
    fn from(v: Option<NaiveDateTime>) -> Self {
        v.map_or(Self::Null, Self::DateTime)
    }
}

/// Shared shape of activation, renewal, deactivation and one-time-purchase rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionTx {
    pub tmuserid: Option<String>,
    pub msisdn: Option<String>,
    pub cpc: Option<i64>,
    pub trans_type_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub channel_act: Option<String>,
    pub channel_dct: Option<String>,
    pub trans_date: NaiveDateTime,
    pub act_date: Option<NaiveDateTime>,
    pub reno_date: Option<NaiveDateTime>,
    pub camp_name: Option<String>,
    pub tef_prov: Option<i64>,
    pub campana_medium: Option<String>,
    pub campana_id: Option<String>,
    pub subscription_id: Option<i64>,
    pub rev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationTx {
    pub cancel_date: NaiveDateTime,
    pub sbn_id: Option<i64>,
    pub tmuserid: Option<String>,
    pub cpc: Option<i64>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundTx {
    pub tmuserid: Option<String>,
    pub cpc: Option<i64>,
    pub refnd_date: NaiveDateTime,
    pub rfnd_amount: Option<f64>,
    pub rfnd_cnt: Option<i64>,
    pub sbnid: Option<i64>,
    pub instant_rfnd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionRecord {
    Activation(SubscriptionTx),
    Renewal(SubscriptionTx),
    Deactivation(SubscriptionTx),
    OneTimePurchase(SubscriptionTx),
    Cancellation(CancellationTx),
    Refund(RefundTx),
}

/// Deduplication key. Two records of the same kind with equal keys describe
/// the same logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    Subscription {
        subscription_id: Option<i64>,
        trans_date: NaiveDateTime,
        trans_type_id: Option<i64>,
    },
    Cancellation {
        sbn_id: Option<i64>,
        cancel_date: NaiveDateTime,
    },
    Refund {
        sbnid: Option<i64>,
        refnd_date: NaiveDateTime,
    },
}

impl SubscriptionTx {
    fn from_fn(trans_date: NaiveDateTime, mut get: impl FnMut(Field) -> Value) -> Self {
        Self {
            tmuserid: get(Field::Tmuserid).into_text(),
            msisdn: get(Field::Msisdn).into_text(),
            cpc: get(Field::Cpc).as_int(),
            trans_type_id: get(Field::TransTypeId).as_int(),
            channel_id: get(Field::ChannelId).as_int(),
            channel_act: get(Field::ChannelAct).into_text(),
            channel_dct: get(Field::ChannelDct).into_text(),
            trans_date,
            act_date: get(Field::ActDate).as_datetime(),
            reno_date: get(Field::RenoDate).as_datetime(),
            camp_name: get(Field::CampName).into_text(),
            tef_prov: get(Field::TefProv).as_int(),
            campana_medium: get(Field::CampanaMedium).into_text(),
            campana_id: get(Field::CampanaId).into_text(),
            subscription_id: get(Field::SubscriptionId).as_int(),
            rev: get(Field::Rev).as_float(),
        }
    }

    fn get(&self, field: Field) -> Value {
        match field {
            Field::Tmuserid => self.tmuserid.clone().into(),
            Field::Msisdn => self.msisdn.clone().into(),
            Field::Cpc => self.cpc.into(),
            Field::TransTypeId => self.trans_type_id.into(),
            Field::ChannelId => self.channel_id.into(),
            Field::ChannelAct => self.channel_act.clone().into(),
            Field::ChannelDct => self.channel_dct.clone().into(),
            Field::TransDate => Value::DateTime(self.trans_date),
            Field::ActDate => self.act_date.into(),
            Field::RenoDate => self.reno_date.into(),
            Field::CampName => self.camp_name.clone().into(),
            Field::TefProv => self.tef_prov.into(),
            Field::CampanaMedium => self.campana_medium.clone().into(),
            Field::CampanaId => self.campana_id.clone().into(),
            Field::SubscriptionId => self.subscription_id.into(),
            Field::Rev => self.rev.into(),
            _ => Value::Null,
        }
    }
}

impl TransactionRecord {
    /// Build a record of `kind` from a per-field accessor. Fields outside the
    /// kind's schema are never requested. Returns `None` when the primary date
    /// is null, since such a row cannot be partitioned.
    pub fn from_fields(kind: Kind, mut get: impl FnMut(Field) -> Value) -> Option<Self> {
        let mut scoped = |field: Field| {
            if kind.has_field(field) {
                get(field)
            } else {
                Value::Null
            }
        };
        let primary = scoped(kind.primary_date()).as_datetime()?;
        let record = match kind {
            Kind::Activation => Self::Activation(SubscriptionTx::from_fn(primary, scoped)),
            Kind::Renewal => Self::Renewal(SubscriptionTx::from_fn(primary, scoped)),
            Kind::Deactivation => Self::Deactivation(SubscriptionTx::from_fn(primary, scoped)),
            Kind::OneTimePurchase => {
                Self::OneTimePurchase(SubscriptionTx::from_fn(primary, scoped))
            }
            Kind::Cancellation => Self::Cancellation(CancellationTx {
                cancel_date: primary,
                sbn_id: scoped(Field::SbnId).as_int(),
                tmuserid: scoped(Field::Tmuserid).into_text(),
                cpc: scoped(Field::Cpc).as_int(),
                mode: scoped(Field::Mode).into_text(),
            }),
            Kind::Refund => Self::Refund(RefundTx {
                tmuserid: scoped(Field::Tmuserid).into_text(),
                cpc: scoped(Field::Cpc).as_int(),
                refnd_date: primary,
                rfnd_amount: scoped(Field::RfndAmount).as_float(),
                rfnd_cnt: scoped(Field::RfndCnt).as_int(),
                sbnid: scoped(Field::Sbnid).as_int(),
                instant_rfnd: scoped(Field::InstantRfnd).into_text(),
            }),
        };
        Some(record)
    }

    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Activation(_) => Kind::Activation,
            Self::Renewal(_) => Kind::Renewal,
            Self::Deactivation(_) => Kind::Deactivation,
            Self::OneTimePurchase(_) => Kind::OneTimePurchase,
            Self::Cancellation(_) => Kind::Cancellation,
            Self::Refund(_) => Kind::Refund,
        }
    }

    const fn subscription(&self) -> Option<&SubscriptionTx> {
        match self {
            Self::Activation(tx)
            | Self::Renewal(tx)
            | Self::Deactivation(tx)
            | Self::OneTimePurchase(tx) => Some(tx),
            Self::Cancellation(_) | Self::Refund(_) => None,
        }
    }

    /// Value of the kind's primary date column.
    #[must_use]
    pub const fn event_time(&self) -> NaiveDateTime {
        match self {
            Self::Activation(tx)
            | Self::Renewal(tx)
            | Self::Deactivation(tx)
            | Self::OneTimePurchase(tx) => tx.trans_date,
            Self::Cancellation(tx) => tx.cancel_date,
            Self::Refund(tx) => tx.refnd_date,
        }
    }

    #[must_use]
    pub fn event_date(&self) -> NaiveDate {
        self.event_time().date()
    }

    #[must_use]
    pub const fn cpc(&self) -> Option<i64> {
        match self {
            Self::Activation(tx)
            | Self::Renewal(tx)
            | Self::Deactivation(tx)
            | Self::OneTimePurchase(tx) => tx.cpc,
            Self::Cancellation(tx) => tx.cpc,
            Self::Refund(tx) => tx.cpc,
        }
    }

    #[must_use]
    pub fn tmuserid(&self) -> Option<&str> {
        match self {
            Self::Activation(tx)
            | Self::Renewal(tx)
            | Self::Deactivation(tx)
            | Self::OneTimePurchase(tx) => tx.tmuserid.as_deref(),
            Self::Cancellation(tx) => tx.tmuserid.as_deref(),
            Self::Refund(tx) => tx.tmuserid.as_deref(),
        }
    }

    #[must_use]
    pub fn msisdn(&self) -> Option<&str> {
        self.subscription().and_then(|tx| tx.msisdn.as_deref())
    }

    /// Revenue for kinds that carry it.
    #[must_use]
    pub fn rev(&self) -> Option<f64> {
        self.subscription().and_then(|tx| tx.rev)
    }

    /// Channel tag used for the upgrade split (`channel_act` or `channel_dct`).
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Activation(tx) | Self::Renewal(tx) => tx.channel_act.as_deref(),
            Self::Deactivation(tx) => tx.channel_dct.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            Self::Activation(tx)
            | Self::Renewal(tx)
            | Self::Deactivation(tx)
            | Self::OneTimePurchase(tx) => NaturalKey::Subscription {
                subscription_id: tx.subscription_id,
                trans_date: tx.trans_date,
                trans_type_id: tx.trans_type_id,
            },
            Self::Cancellation(tx) => NaturalKey::Cancellation {
                sbn_id: tx.sbn_id,
                cancel_date: tx.cancel_date,
            },
            Self::Refund(tx) => NaturalKey::Refund {
                sbnid: tx.sbnid,
                refnd_date: tx.refnd_date,
            },
        }
    }

    /// Cell value for `field`; `Null` for fields outside this kind's schema.
    #[must_use]
    pub fn get(&self, field: Field) -> Value {
        if !self.kind().has_field(field) {
            return Value::Null;
        }
        match self {
            Self::Activation(tx)
            | Self::Renewal(tx)
            | Self::Deactivation(tx)
            | Self::OneTimePurchase(tx) => tx.get(field),
            Self::Cancellation(tx) => match field {
                Field::CancelDate => Value::DateTime(tx.cancel_date),
                Field::SbnId => tx.sbn_id.into(),
                Field::Tmuserid => tx.tmuserid.clone().into(),
                Field::Cpc => tx.cpc.into(),
                Field::Mode => tx.mode.clone().into(),
                _ => Value::Null,
            },
            Self::Refund(tx) => match field {
                Field::Tmuserid => tx.tmuserid.clone().into(),
                Field::Cpc => tx.cpc.into(),
                Field::RefndDate => Value::DateTime(tx.refnd_date),
                Field::RfndAmount => tx.rfnd_amount.into(),
                Field::RfndCnt => tx.rfnd_cnt.into(),
                Field::Sbnid => tx.sbnid.into(),
                Field::InstantRfnd => tx.instant_rfnd.clone().into(),
                _ => Value::Null,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    pub fn subscription(trans_date: &str, subscription_id: i64, cpc: i64) -> SubscriptionTx {
        SubscriptionTx {
            tmuserid: Some(format!("tm{subscription_id}")),
            msisdn: Some(format!("34600{subscription_id:06}")),
            cpc: Some(cpc),
            trans_type_id: Some(1),
            channel_id: None,
            channel_act: None,
            channel_dct: None,
            trans_date: ts(trans_date),
            act_date: None,
            reno_date: None,
            camp_name: None,
            tef_prov: None,
            campana_medium: None,
            campana_id: None,
            subscription_id: Some(subscription_id),
            rev: None,
        }
    }

    pub fn activation(trans_date: &str, subscription_id: i64, cpc: i64, rev: f64) -> TransactionRecord {
        let mut tx = subscription(trans_date, subscription_id, cpc);
        tx.rev = Some(rev);
        TransactionRecord::Activation(tx)
    }

    pub fn refund(refnd_date: &str, sbnid: i64, cpc: i64, amount: f64) -> TransactionRecord {
        TransactionRecord::Refund(RefundTx {
            tmuserid: Some(format!("tm{sbnid}")),
            cpc: Some(cpc),
            refnd_date: ts(refnd_date),
            rfnd_amount: Some(amount),
            rfnd_cnt: Some(1),
            sbnid: Some(sbnid),
            instant_rfnd: None,
        })
    }
}
