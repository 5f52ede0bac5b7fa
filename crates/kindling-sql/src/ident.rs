use crate::fmt::{Formatter, ToSql};

/// A double-quoted SQL identifier.
pub(crate) struct Ident<T>(pub T);

impl<T: AsRef<str>> ToSql for Ident<T> {
    fn to_sql(self, f: &mut Formatter) {
        f.dst.push('"');
        f.dst.push_str(self.0.as_ref());
        f.dst.push('"');
    }
}
