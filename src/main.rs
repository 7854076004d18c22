use csv_core::{ReadFieldResult, ReaderBuilder};
use groupcast::{Frame, GroupSet};
use std::io;
use std::str;

fn load_frame<I: io::Read>(mut input: I) -> io::Result<Frame> {
    let mut inputbuf = [0; 16384];
    let mut fieldbuf = [0; 1024];
    let mut fieldlen = 0;
    let mut record = Vec::new();
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut tsv = ReaderBuilder::new().delimiter(b'\t').build();

    loop {
        let read = input.read(&mut inputbuf)?;
        let mut bytes = &inputbuf[..read];
        loop {
            let (result, nin, nout) = tsv.read_field(bytes, &mut fieldbuf[fieldlen..]);
            bytes = &bytes[nin..];
            fieldlen += nout;
            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("field too long on line {}", tsv.line()),
                    ));
                }
                ReadFieldResult::Field { record_end } => {
                    let field = str::from_utf8(&fieldbuf[..fieldlen])
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    fieldlen = 0;
                    record.push(field.to_owned());
                    if record_end {
                        records.push(std::mem::take(&mut record));
                    }
                }
                ReadFieldResult::End => {
                    if !record.is_empty() {
                        records.push(std::mem::take(&mut record));
                    }
                    return frame_from_records(records);
                }
            }
        }
    }
}

/// The first record names the columns; every following record is one row.
fn frame_from_records(records: Vec<Vec<String>>) -> io::Result<Frame> {
    let mut records = records.into_iter();
    let header = records
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing header row"))?;

    let mut columns: Vec<Vec<String>> = vec![Vec::new(); header.len()];
    for (at, record) in records.enumerate() {
        if record.len() != header.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "row {} has {} fields but the header has {}",
                    at + 2,
                    record.len(),
                    header.len()
                ),
            ));
        }
        for (column, field) in columns.iter_mut().zip(record) {
            column.push(field);
        }
    }

    let mut frame = Frame::new();
    for (name, values) in header.into_iter().zip(columns) {
        frame.push_column(name, values);
    }
    Ok(frame)
}

fn main() -> io::Result<()> {
    env_logger::init();

    let frame = load_frame(io::stdin().lock())?;
    let set = GroupSet::build(&frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    for group in set.groups() {
        println!("{} ({} members)", set.name(group.id()), group.len());

        let parents: Vec<&str> = group.parents().iter().map(|id| set.name(id)).collect();
        if !parents.is_empty() {
            println!("  parents: {}", parents.join(", "));
        }
        let children: Vec<&str> = group.children().iter().map(|id| set.name(id)).collect();
        if !children.is_empty() {
            println!("  children: {}", children.join(", "));
        }
        let twins: Vec<&str> = group
            .twins()
            .iter()
            .filter(|&id| id != group.id())
            .map(|id| set.name(id))
            .collect();
        if !twins.is_empty() {
            println!("  twins: {}", twins.join(", "));
        }
    }

    println!();
    for (column, labels) in set.coords() {
        println!("{}: {:?}", column, labels);
    }

    Ok(())
}
