//! Common utility code for noodles.

use std::{
    fs::File,
    io::{BufRead, Read, Seek},
    path::Path,
};

use noodles_bgzf as bgzf;
use noodles_core::Position;
use noodles_csi::binning_index::index::{self, reference_sequence::bin::Chunk};
use noodles_tabix as tabix;
use noodles_vcf as vcf;

/// Raw VCF header as read from the start of a BGZF file.
#[derive(Debug, Clone)]
pub struct RawHeader {
    /// The header lines, including the `#CHROM` line, newline-terminated.
    pub text: String,
    /// Virtual position of the first data record.
    pub data_start: bgzf::VirtualPosition,
}

/// Open the BGZF file at `path` for reading.
pub fn open_bgzf<P>(path: P) -> Result<bgzf::Reader<File>, std::io::Error>
where
    P: AsRef<Path>,
{
    File::open(path.as_ref()).map(bgzf::Reader::new)
}

/// Return whether the next line in `reader` starts with `#`.
///
/// This forces the next block to be loaded so that the reported virtual
/// position afterwards points into the block holding the next line.
fn next_is_header<R: Read>(reader: &mut bgzf::Reader<R>) -> Result<bool, std::io::Error> {
    let buf = reader.fill_buf()?;
    Ok(buf.first() == Some(&b'#'))
}

/// Peek whether there is at least one more byte to read.
pub fn at_eof<R: Read>(reader: &mut bgzf::Reader<R>) -> Result<bool, std::io::Error> {
    Ok(reader.fill_buf()?.is_empty())
}

/// Read the header lines from the start of `reader`.
pub fn read_raw_header<R: Read>(reader: &mut bgzf::Reader<R>) -> Result<RawHeader, std::io::Error> {
    let mut text = String::new();
    while next_is_header(reader)? {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if !line.ends_with('\n') {
            line.push('\n');
        }
        text.push_str(&line);
    }

    Ok(RawHeader {
        text,
        data_start: reader.virtual_position(),
    })
}

/// Seek `reader` to `pos` and return the normalized virtual position.
///
/// After seeking to the end of a block, the reported position is moved to
/// the start of the following block so that positions compare equal to the
/// ones recorded while streaming.
pub fn seek_normalized<R: Read + Seek>(
    reader: &mut bgzf::Reader<R>,
    pos: bgzf::VirtualPosition,
) -> Result<bgzf::VirtualPosition, std::io::Error> {
    reader.seek(pos)?;
    reader.fill_buf()?;
    Ok(reader.virtual_position())
}

/// Build TBI for the BGZF compressed VCF file at `path_src` and write to `path_dst`.
pub fn build_tbi<S, D>(path_src: S, path_dst: D) -> Result<(), anyhow::Error>
where
    S: AsRef<Path>,
    D: AsRef<Path>,
{
    let mut reader = open_bgzf(path_src.as_ref())
        .map(vcf::Reader::new)
        .map_err(|e| anyhow::anyhow!("error input file for tbi creation: {}", e))?;
    let header = reader
        .read_header()
        .map_err(|e| anyhow::anyhow!("error reading header: {}", e))?;

    let mut indexer = tabix::index::Indexer::default();
    indexer.set_header(index::header::Builder::vcf().build());

    let mut record = vcf::Record::default();
    let mut record_count = 0usize;
    loop {
        at_eof(reader.get_mut())?;
        let start_position = reader.virtual_position();
        match reader.read_record(&header, &mut record) {
            Ok(0) => break,
            Ok(_) => (),
            Err(e) => anyhow::bail!("problem reading record {}: {}", record_count + 1, e),
        }
        at_eof(reader.get_mut())?;
        let end_position = reader.virtual_position();
        record_count += 1;

        let start = Position::try_from(usize::from(record.position()))
            .map_err(|e| anyhow::anyhow!("error converting start position: {}", e))?;
        let end = record
            .end()
            .map_err(|e| anyhow::anyhow!("error determining end position: {}", e))
            .and_then(|end| {
                Position::try_from(usize::from(end).max(usize::from(start)))
                    .map_err(|e| anyhow::anyhow!("error converting end position: {}", e))
            })?;

        indexer
            .add_record(
                &record.chromosome().to_string(),
                start,
                end,
                Chunk::new(start_position, end_position),
            )
            .map_err(|e| anyhow::anyhow!("error adding record to tabix index: {}", e))?;
    }

    // Without records the indexer drops its header, which readers require.
    let index = if record_count == 0 {
        tabix::Index::builder()
            .set_header(index::header::Builder::vcf().build())
            .build()
    } else {
        indexer.build()
    };
    tracing::debug!("indexed {} records", record_count);

    let mut writer = File::create(path_dst.as_ref())
        .map(tabix::Writer::new)
        .map_err(|e| anyhow::anyhow!("error output file for tbi creation: {}", e))?;
    writer
        .write_index(&index)
        .map_err(|e| anyhow::anyhow!("error writing tabix index: {}", e))?;

    Ok(())
}

#[cfg(test)]
pub mod testing {
    //! Helpers for writing BGZF compressed test inputs.

    use std::{io::Write, path::Path};

    use noodles_bgzf as bgzf;

    /// Write `text` as BGZF to `path`, starting a new block every `lines_per_block` lines.
    pub fn write_bgzf<P: AsRef<Path>>(
        path: P,
        text: &str,
        lines_per_block: usize,
    ) -> Result<(), anyhow::Error> {
        let mut writer = bgzf::Writer::new(std::fs::File::create(path.as_ref())?);
        for (i, line) in text.lines().enumerate() {
            if i > 0 && lines_per_block > 0 && i % lines_per_block == 0 {
                writer.flush()?;
            }
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.try_finish()?;
        Ok(())
    }

    /// Write `text` as BGZF to `path` and build the `.tbi` next to it.
    pub fn write_indexed_vcf<P: AsRef<Path>>(
        path: P,
        text: &str,
        lines_per_block: usize,
    ) -> Result<(), anyhow::Error> {
        write_bgzf(path.as_ref(), text, lines_per_block)?;
        let path_tbi = format!("{}.tbi", path.as_ref().display());
        super::build_tbi(path.as_ref(), path_tbi)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::BufRead;

    use pretty_assertions::assert_eq;

    use super::testing::write_indexed_vcf;

    const VCF: &str = "##fileformat=VCFv4.2
##contig=<ID=1,length=249250621>
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO
1\t100\t.\tA\tG\t50\tPASS\t.
1\t50000\t.\tC\tT\t50\tPASS\t.
1\t100000\t.\tG\tA\t50\tPASS\t.
";

    #[test]
    fn read_raw_header() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_indexed_vcf(&path, VCF, 2)?;

        let mut reader = super::open_bgzf(&path)?;
        let header = super::read_raw_header(&mut reader)?;

        assert_eq!(header.text.lines().count(), 3);
        assert!(header.text.ends_with("INFO\n"));

        let mut line = String::new();
        reader.read_line(&mut line)?;
        assert_eq!(line, "1\t100\t.\tA\tG\t50\tPASS\t.\n");

        Ok(())
    }

    #[test]
    fn build_tbi() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        write_indexed_vcf(&path, VCF, 2)?;

        let index = noodles_tabix::read(tmpdir.join("in.vcf.gz.tbi"))?;
        let chunk_count: usize = index
            .reference_sequences()
            .iter()
            .flat_map(|reference_sequence| reference_sequence.bins().values())
            .map(|bin| bin.chunks().len())
            .sum();

        assert!(chunk_count >= 3);

        Ok(())
    }

    #[test]
    fn build_tbi_without_records() -> Result<(), anyhow::Error> {
        use noodles_csi::BinningIndex;

        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        let header_only = VCF
            .lines()
            .take_while(|line| line.starts_with('#'))
            .map(|line| format!("{}\n", line))
            .collect::<String>();
        write_indexed_vcf(&path, &header_only, 0)?;

        let index = noodles_tabix::read(tmpdir.join("in.vcf.gz.tbi"))?;

        assert!(index.reference_sequences().is_empty());
        assert!(index.header().is_some());

        Ok(())
    }

    #[test]
    fn build_tbi_rejects_malformed_record() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("in.vcf.gz");
        let text = VCF.replace("1\t50000\t", "1\tfifty\t");
        super::testing::write_bgzf(&path, &text, 0)?;

        let err = super::build_tbi(&path, tmpdir.join("in.vcf.gz.tbi")).expect_err("must fail");

        assert!(err.to_string().contains("problem reading record 2"));

        Ok(())
    }
}
