mod err;
pub use err::{Error, Result};
mod types;
pub use types::{TypeConverter, TypeConverterRegistry, UnknownConverter};
mod meta;
pub use meta::{
    descriptor_for, register_type, MetaObject, PropertyTokenizer, TypeDescriptor,
};
mod cache;
pub use cache::{Cache, CacheBuilder, CacheKey};
mod pool;
pub use pool::{PoolConfig, PoolStatus, PooledConnection, PooledDataSource, UnpooledDataSource};
mod transaction;
pub use transaction::{
    ExternalTransaction, ManagedTransaction, Transaction, TransactionFactory,
};
mod sql;
pub use sql::{BoundSql, DynamicContext, SqlNode, SqlSource, StaticSqlSource};
mod mapping;
pub use mapping::{
    CommandKind, Discriminator, KeyGeneratorKind, MappedStatement, ParameterMap,
    ParameterMapping, ParameterMode, ResultMap, ResultMapping, StatementKind,
};
mod registry;
pub use registry::{
    AutoMappingBehavior, AutoMappingUnknownColumnBehavior, Configuration, Environment,
    ExecutorType, LocalCacheScope, Settings,
};
mod builder;
pub use builder::{XmlConfigBuilder, XmlMapperBuilder};
mod executor;
pub use executor::{
    BatchResult, CachingExecutor, Executor, ListResultHandler, ResultContext, ResultHandler,
    RowBounds, SessionExecutor,
};
mod session;
pub use session::{
    pack_args, pack_named, Mapper, SessionCursor, SqlSession, SqlSessionFactory,
};
