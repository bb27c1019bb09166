use std::ops::Deref;

use tempfile::{Builder, NamedTempFile};

use crate::db::{DB, Options};

pub(crate) fn temp_file() -> crate::Result<NamedTempFile> {
    let temp_file = Builder::new()
        .prefix("burrowdb-")
        .suffix(".db")
        .tempfile()?;

    Ok(temp_file)
}

/// Database fixture bound to a temporary file, removed on drop.
pub(crate) struct TestDb {
    _temp_file: NamedTempFile,
    db: DB,
}

impl Deref for TestDb {
    type Target = DB;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl TestDb {
    pub(crate) fn new() -> crate::Result<Self> {
        Self::with_options(Options::default())
    }

    pub(crate) fn with_options(options: Options) -> crate::Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let temp_file = temp_file()?;
        let db = DB::open_with(temp_file.path(), options)?;

        Ok(Self {
            _temp_file: temp_file,
            db,
        })
    }

    pub(crate) fn db(&self) -> DB {
        self.db.clone()
    }
}
