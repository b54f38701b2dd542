//! Common, IO-related code.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use flate2::bufread::MultiGzDecoder;

/// Transparently open a file with gzip decoder.
///
/// Files ending in `.gz` (including BGZF files, which are valid multi-member
/// gzip) are decompressed on the fly.
pub fn open_read_maybe_gz<P>(path: P) -> Result<Box<dyn BufRead + Send>, anyhow::Error>
where
    P: AsRef<Path>,
{
    if path.as_ref().extension().map(|s| s.to_str()) == Some(Some("gz")) {
        tracing::trace!("Opening {:?} as gzip for reading", path.as_ref());
        let file = File::open(path)?;
        let bufreader = BufReader::new(file);
        let decoder = MultiGzDecoder::new(bufreader);
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        tracing::trace!("Opening {:?} as plain text for reading", path.as_ref());
        let file = File::open(path)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, Write};

    use flate2::{write::GzEncoder, Compression};
    use pretty_assertions::assert_eq;

    #[rstest::rstest]
    #[case(true)]
    #[case(false)]
    fn open_read_maybe_gz(#[case] is_gzip: bool) -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let filename = if is_gzip { "test.txt.gz" } else { "test.txt" };
        let path = tmp_dir.join(filename);

        {
            let file = std::fs::File::create(&path)?;
            if is_gzip {
                let mut encoder = GzEncoder::new(file, Compression::default());
                encoder.write_all(b"line 1\nline 2\n")?;
                encoder.finish()?;
            } else {
                let mut file = file;
                file.write_all(b"line 1\nline 2\n")?;
            }
        }

        let lines = super::open_read_maybe_gz(&path)?
            .lines()
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(lines, vec![String::from("line 1"), String::from("line 2")]);

        Ok(())
    }

    #[test]
    fn open_read_missing_file() {
        assert!(super::open_read_maybe_gz("tests/does/not/exist.bed").is_err());
    }
}
