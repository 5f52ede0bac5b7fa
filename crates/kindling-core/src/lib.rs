mod error;
pub use error::{Error, ErrorKind};

pub mod cond;
pub mod convert;
pub mod entity;
pub mod key;
pub mod kind;
pub mod query;
pub mod registry;
pub mod tags;
pub mod value;

pub use cond::{Compound, Condition, ConditionCx, RefArg};
pub use convert::{BasicConverter, ColumnScan, Converter, ReferenceConverter};
pub use entity::{cast_mut, cast_ref, Entity, EntityMeta, Handle, Ref};
pub use key::{Key, KeyPart};
pub use kind::{Column, Kind, KindBuilder, Persist};
pub use query::{
    Aggregate, Computed, Join, JoinDirection, JoinType, Params, Query, QueryTable, Sort,
    SortOrder, SubQuery,
};
pub use registry::{kind_for_type_id, kind_named, kind_of};
pub use tags::Tags;
pub use value::{FieldCodec, Value, ValueBag};

/// A Result type alias that uses kindling's [`Error`] type.
pub type Result<T, E = Error> = core::result::Result<T, E>;
