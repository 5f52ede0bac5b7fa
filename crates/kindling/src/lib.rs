mod cache;
pub use cache::EntityCache;

mod manager;
pub use manager::EntityManager;

mod scanner;
pub use scanner::{ResultRow, ScannerSet};

pub use kindling_core::{
    cast_mut, cast_ref, impl_entity, kind_for_type_id, kind_named, kind_of, Aggregate, Compound,
    Computed, Condition, ConditionCx, Entity, EntityMeta, Error, ErrorKind, Handle, Join,
    JoinDirection, JoinType, Key, KeyPart, Kind, KindBuilder, Params, Persist, Query, QueryTable,
    Ref, RefArg, Result, Sort, SortOrder, SubQuery, Tags, Value,
};
pub use kindling_postgres::{Adapter, AdapterConfig, Connection};
pub use kindling_sql::render_query;
