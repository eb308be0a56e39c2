//! The command model.
//!
//! Every operation a client can ask of a remote engine is one [`Command`]
//! variant. A request and its result share the variant: the client fills the
//! inputs and leaves the result fields empty, the server sends the same
//! variant back with the result fields populated.
//!
//! # Key Components
//!
//! - [`CommandCode`]: stable wire discriminant of each variant.
//! - [`Command`]: the closed set of table, engine and heap operations.
//! - [`Scope`]: which side of the dispatcher executes a command.
use crate::{
    data::{Data, DataType},
    descriptor::Descriptor,
    protocol::wire::CodecError,
};

/// One key/record pair.
pub type Row = (Data, Data);

/// Wire code of every command. Both ends of a connection must agree on this
/// table; values are never reused.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Undefined = 0,

    Replace = 1,
    Delete = 2,
    DeleteRange = 3,
    InsertOrIgnore = 4,
    Clear = 5,
    TryGet = 6,
    Forward = 7,
    Backward = 8,
    FindNext = 9,
    FindAfter = 10,
    FindPrev = 11,
    FindBefore = 12,
    FirstRow = 13,
    LastRow = 14,
    Count = 15,
    DescriptorGet = 16,
    DescriptorSet = 17,

    Commit = 20,
    Enumerate = 21,
    Rename = 22,
    Exists = 23,
    FindById = 24,
    FindByName = 25,
    OpenTable = 26,
    OpenFile = 27,
    DeleteTable = 28,
    CountTables = 29,
    GetCacheSize = 30,
    SetCacheSize = 31,

    ObtainHandle = 40,
    ReleaseHandle = 41,
    HandleExists = 42,
    HeapWrite = 43,
    HeapRead = 44,
    HeapCommit = 45,
    HeapClose = 46,
    HeapSetTag = 47,
    HeapGetTag = 48,
    HeapDataSize = 49,
    HeapSize = 50,

    Exception = 100,
}

impl CommandCode {
    /// Codes eligible for payload-only batch encoding.
    pub fn is_bulk_mutation(self) -> bool {
        matches!(
            self,
            CommandCode::Replace
                | CommandCode::InsertOrIgnore
                | CommandCode::Delete
                | CommandCode::DeleteRange
                | CommandCode::Clear
        )
    }

    pub fn scope(self) -> Scope {
        match self as i32 {
            1..=17 => Scope::Table,
            20..=31 => Scope::Engine,
            40..=50 => Scope::Heap,
            _ => Scope::Control,
        }
    }
}

impl TryFrom<i32> for CommandCode {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        use CommandCode::*;
        let code = match value {
            0 => Undefined,
            1 => Replace,
            2 => Delete,
            3 => DeleteRange,
            4 => InsertOrIgnore,
            5 => Clear,
            6 => TryGet,
            7 => Forward,
            8 => Backward,
            9 => FindNext,
            10 => FindAfter,
            11 => FindPrev,
            12 => FindBefore,
            13 => FirstRow,
            14 => LastRow,
            15 => Count,
            16 => DescriptorGet,
            17 => DescriptorSet,
            20 => Commit,
            21 => Enumerate,
            22 => Rename,
            23 => Exists,
            24 => FindById,
            25 => FindByName,
            26 => OpenTable,
            27 => OpenFile,
            28 => DeleteTable,
            29 => CountTables,
            30 => GetCacheSize,
            31 => SetCacheSize,
            40 => ObtainHandle,
            41 => ReleaseHandle,
            42 => HandleExists,
            43 => HeapWrite,
            44 => HeapRead,
            45 => HeapCommit,
            46 => HeapClose,
            47 => HeapSetTag,
            48 => HeapGetTag,
            49 => HeapDataSize,
            50 => HeapSize,
            100 => Exception,
            other => return Err(CodecError::UnknownCommand(other)),
        };
        Ok(code)
    }
}

/// Executor a command is routed to on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Table,
    Engine,
    Heap,
    Control,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // table commands
    Replace {
        key: Data,
        record: Data,
    },
    Delete {
        key: Data,
    },
    /// Removes every key in `[from, to]`.
    DeleteRange {
        from: Data,
        to: Data,
    },
    InsertOrIgnore {
        key: Data,
        record: Data,
    },
    Clear,
    TryGet {
        key: Data,
        record: Option<Data>,
    },
    /// One page of an ascending scan over `[from, to]`.
    Forward {
        page_count: i32,
        from: Option<Data>,
        to: Option<Data>,
        rows: Option<Vec<Row>>,
    },
    /// One page of a descending scan from `from` down to `to`.
    Backward {
        page_count: i32,
        from: Option<Data>,
        to: Option<Data>,
        rows: Option<Vec<Row>>,
    },
    /// First row with a key `>= key`.
    FindNext {
        key: Data,
        row: Option<Row>,
    },
    /// First row with a key `> key`.
    FindAfter {
        key: Data,
        row: Option<Row>,
    },
    /// Last row with a key `<= key`.
    FindPrev {
        key: Data,
        row: Option<Row>,
    },
    /// Last row with a key `< key`.
    FindBefore {
        key: Data,
        row: Option<Row>,
    },
    FirstRow {
        row: Option<Row>,
    },
    LastRow {
        row: Option<Row>,
    },
    Count {
        count: i64,
    },
    DescriptorGet {
        descriptor: Option<Descriptor>,
    },
    DescriptorSet {
        descriptor: Option<Descriptor>,
    },

    // engine commands
    Commit,
    Enumerate {
        descriptors: Option<Vec<Descriptor>>,
    },
    Rename {
        name: String,
        new_name: String,
    },
    Exists {
        name: String,
        exists: bool,
    },
    FindById {
        id: i64,
        descriptor: Option<Descriptor>,
    },
    FindByName {
        name: String,
        descriptor: Option<Descriptor>,
    },
    OpenTable {
        name: String,
        key_type: DataType,
        record_type: DataType,
        descriptor: Option<Descriptor>,
    },
    OpenFile {
        name: String,
        id: i64,
    },
    DeleteTable {
        name: String,
    },
    CountTables {
        count: u64,
    },
    GetCacheSize {
        cache_size: i32,
    },
    SetCacheSize {
        cache_size: i32,
    },

    // heap commands
    ObtainHandle {
        handle: i64,
    },
    ReleaseHandle {
        handle: i64,
    },
    HandleExists {
        handle: i64,
        exists: bool,
    },
    /// Stores `buffer[index..index + count]` under `handle`.
    HeapWrite {
        handle: i64,
        buffer: Option<Vec<u8>>,
        index: i32,
        count: i32,
    },
    HeapRead {
        handle: i64,
        buffer: Option<Vec<u8>>,
    },
    HeapCommit,
    HeapClose,
    HeapSetTag {
        tag: Option<Vec<u8>>,
    },
    HeapGetTag {
        tag: Option<Vec<u8>>,
    },
    HeapDataSize {
        size: i64,
    },
    HeapSize {
        size: i64,
    },

    /// Failure raised while executing a batch on the server.
    Exception {
        message: String,
    },
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::Replace { .. } => CommandCode::Replace,
            Command::Delete { .. } => CommandCode::Delete,
            Command::DeleteRange { .. } => CommandCode::DeleteRange,
            Command::InsertOrIgnore { .. } => CommandCode::InsertOrIgnore,
            Command::Clear => CommandCode::Clear,
            Command::TryGet { .. } => CommandCode::TryGet,
            Command::Forward { .. } => CommandCode::Forward,
            Command::Backward { .. } => CommandCode::Backward,
            Command::FindNext { .. } => CommandCode::FindNext,
            Command::FindAfter { .. } => CommandCode::FindAfter,
            Command::FindPrev { .. } => CommandCode::FindPrev,
            Command::FindBefore { .. } => CommandCode::FindBefore,
            Command::FirstRow { .. } => CommandCode::FirstRow,
            Command::LastRow { .. } => CommandCode::LastRow,
            Command::Count { .. } => CommandCode::Count,
            Command::DescriptorGet { .. } => CommandCode::DescriptorGet,
            Command::DescriptorSet { .. } => CommandCode::DescriptorSet,
            Command::Commit => CommandCode::Commit,
            Command::Enumerate { .. } => CommandCode::Enumerate,
            Command::Rename { .. } => CommandCode::Rename,
            Command::Exists { .. } => CommandCode::Exists,
            Command::FindById { .. } => CommandCode::FindById,
            Command::FindByName { .. } => CommandCode::FindByName,
            Command::OpenTable { .. } => CommandCode::OpenTable,
            Command::OpenFile { .. } => CommandCode::OpenFile,
            Command::DeleteTable { .. } => CommandCode::DeleteTable,
            Command::CountTables { .. } => CommandCode::CountTables,
            Command::GetCacheSize { .. } => CommandCode::GetCacheSize,
            Command::SetCacheSize { .. } => CommandCode::SetCacheSize,
            Command::ObtainHandle { .. } => CommandCode::ObtainHandle,
            Command::ReleaseHandle { .. } => CommandCode::ReleaseHandle,
            Command::HandleExists { .. } => CommandCode::HandleExists,
            Command::HeapWrite { .. } => CommandCode::HeapWrite,
            Command::HeapRead { .. } => CommandCode::HeapRead,
            Command::HeapCommit => CommandCode::HeapCommit,
            Command::HeapClose => CommandCode::HeapClose,
            Command::HeapSetTag { .. } => CommandCode::HeapSetTag,
            Command::HeapGetTag { .. } => CommandCode::HeapGetTag,
            Command::HeapDataSize { .. } => CommandCode::HeapDataSize,
            Command::HeapSize { .. } => CommandCode::HeapSize,
            Command::Exception { .. } => CommandCode::Exception,
        }
    }

    /// Whether the caller waits for a result. Fire-and-forget mutations are
    /// the only asynchronous commands; they may sit in a batch until a later
    /// flush.
    pub fn is_synchronous(&self) -> bool {
        !matches!(
            self,
            Command::Replace { .. }
                | Command::Delete { .. }
                | Command::DeleteRange { .. }
                | Command::InsertOrIgnore { .. }
                | Command::Clear
        )
    }

    pub fn scope(&self) -> Scope {
        self.code().scope()
    }
}
