use tokweave::block_index::BlockIndex;
use tokweave::char_index::{CharIndex, CxFormat, CxWriter};
use tokweave::indexer::{index_document, IndexerConfig};
use tokweave::merge::{merge_document, MergeFormat};
use tokweave::reverse_index::OffsetIndex;
use tokweave::standoff::{default_xml_base, standoff_tokens};
use tokweave::tokens::TokenData;

use tempfile::TempDir;

const SOURCE: &str = r#"<text><c xml:id="c1">H</c><c xml:id="c2">i</c><lb/></text>"#;
const TOKENS: &str = r#"<s xml:id="s1"><w xml:id="w1" t="Hi" b="0 2" c="c1 c2"/></s>"#;

/// Index a document in memory and return (cx, sx bytes, tx bytes).
fn index_in_memory(src: &str, config: &IndexerConfig) -> (CharIndex, Vec<u8>, Vec<u8>) {
    let mut cx_buf = Vec::new();
    let mut sx_buf = Vec::new();
    let mut tx_buf = Vec::new();
    let writer = CxWriter::new(&mut cx_buf, CxFormat::Binary, false, false)
        .expect("index header write should succeed");
    index_document(
        src.as_bytes(),
        "doc.xml",
        Some(writer),
        Some(&mut sx_buf),
        Some(&mut tx_buf),
        config,
    )
    .expect("indexing should succeed");
    let cx = CharIndex::read("doc.cx", &cx_buf).expect("index load should succeed");
    (cx, sx_buf, tx_buf)
}

/// Test the complete pipeline on the two-character document: index,
/// reverse-index, token load, merge.
#[test]
fn test_pipeline_end_to_end() {
    let (cx, sx, tx) = index_in_memory(SOURCE, &IndexerConfig::default());

    // Index records carry exact source offsets.
    assert_eq!(cx.len(), 3);
    assert_eq!(cx.records()[0].xml_off, 6);
    assert_eq!(cx.records()[0].xml_len, 20);
    assert_eq!(cx.records()[1].xml_off, 26);
    assert_eq!(cx.records()[2].xml_off, 46);
    assert_eq!(cx.derived_text(), "Hi\n");

    // Structure index: markup skeleton plus one location marker ahead
    // of the closing tag.
    assert_eq!(
        String::from_utf8(sx).expect("structure index should be UTF-8"),
        r#"<text><c n="0 51 0 3"/></text>"#
    );
    assert_eq!(tx, b"Hi\n");

    // Tokenize the whole stream as one block and merge back.
    let text_index = OffsetIndex::over_text(&cx);
    let bx = BlockIndex::whole_stream(cx.text_len());
    let txt_index = OffsetIndex::over_tokenizer(&bx, &text_index);
    let data = TokenData::load("doc.t.xml", TOKENS.as_bytes(), &cx, &txt_index)
        .expect("token load should succeed");

    let mut merged = Vec::new();
    let stats = merge_document(
        SOURCE.as_bytes(),
        "doc.xml",
        &cx,
        &data,
        &MergeFormat::default(),
        &mut merged,
    )
    .expect("merge should succeed");

    assert_eq!(
        String::from_utf8(merged).expect("merged output should be UTF-8"),
        concat!(
            "<text>\n",
            r#"<s xml:id="s1"><w xml:id="w1"><c xml:id="c1">H</c><c xml:id="c2">i</c></w></s>"#,
            "\n<lb/></text>"
        )
    );
    assert_eq!(stats.records, 3);
    assert_eq!(stats.sentence_segs, 1);
    assert_eq!(stats.token_segs, 1);
    assert_eq!(stats.offset_drift, 0);
}

/// Test that a token crossing reordered blocks merges into multiple
/// part-marked segments with back-references.
#[test]
fn test_pipeline_discontinuous_token() {
    let source = concat!(
        r#"<text><c xml:id="a">a</c><c xml:id="b">b</c>"#,
        r#"<c xml:id="c">c</c><c xml:id="d">d</c></text>"#
    );
    let (cx, _, _) = index_in_memory(source, &IndexerConfig::default());
    let text_index = OffsetIndex::over_text(&cx);

    // The tokenizer saw three blocks with a separator byte after the
    // first two, and the last two blocks swapped.
    let bx_text = "%% reordered blocks\n\
                   p1\t0\t2\t0\t3\n\
                   p2\t3\t1\t3\t2\n\
                   p3\t2\t1\t5\t1\n";
    let bx = BlockIndex::read("doc.bx", bx_text.as_bytes()).expect("block load should succeed");
    let txt_index = OffsetIndex::over_tokenizer(&bx, &text_index);

    // One token spanning stream bytes 3..6: records d then c, which are
    // records 3 and 2 of the document.
    let tokens = r#"<s xml:id="s1"><w xml:id="w1" b="0 2"/><w xml:id="w2" b="3 3"/></s>"#;
    let data = TokenData::load("doc.t.xml", tokens.as_bytes(), &cx, &txt_index)
        .expect("token load should succeed");
    assert_eq!(data.tokens[0].covered, vec![0, 1]);
    assert_eq!(data.tokens[1].covered, vec![2, 3]);
    assert_eq!(data.tokens[1].nsegs, 1);

    let mut merged = Vec::new();
    merge_document(
        source.as_bytes(),
        "doc.xml",
        &cx,
        &data,
        &MergeFormat::default(),
        &mut merged,
    )
    .expect("merge should succeed");
    let merged = String::from_utf8(merged).expect("merged output should be UTF-8");
    assert!(merged.contains(r#"<w xml:id="w1"><c xml:id="a">a</c><c xml:id="b">b</c></w>"#));
    assert!(merged.contains(r#"<w xml:id="w2"><c xml:id="c">c</c><c xml:id="d">d</c></w>"#));
}

/// Test that a token whose coverage has a document-order gap produces
/// part="I"/part="F" segments with a back-reference.
#[test]
fn test_pipeline_token_with_gap() {
    let source = concat!(
        r#"<text><c xml:id="a">a</c><c xml:id="b">b</c>"#,
        r#"<c xml:id="c">c</c></text>"#
    );
    let (cx, _, _) = index_in_memory(source, &IndexerConfig::default());
    let text_index = OffsetIndex::over_text(&cx);

    // Record b never reached the tokenizer.
    let bx = BlockIndex::read("doc.bx", b"p1\t0\t1\t0\t1\np2\t2\t1\t1\t1\n")
        .expect("block load should succeed");
    let txt_index = OffsetIndex::over_tokenizer(&bx, &text_index);
    let data = TokenData::load(
        "doc.t.xml",
        br#"<s xml:id="s1"><w xml:id="w1" b="0 2"/></s>"#,
        &cx,
        &txt_index,
    )
    .expect("token load should succeed");
    assert_eq!(data.tokens[0].nsegs, 2);

    let mut merged = Vec::new();
    let stats = merge_document(
        source.as_bytes(),
        "doc.xml",
        &cx,
        &data,
        &MergeFormat::default(),
        &mut merged,
    )
    .expect("merge should succeed");
    let merged = String::from_utf8(merged).expect("merged output should be UTF-8");
    assert!(merged.contains(r#"<w part="I" xml:id="w1" seg="1/2"><c xml:id="a">a</c></w>"#));
    assert!(merged.contains(r##"<w part="F" n="#w1" seg="2/2"><c xml:id="c">c</c></w>"##));
    // The skipped record stays inside the sentence, outside any token.
    assert!(merged.contains(r#"</w><c xml:id="b">b</c><w part="F""#));
    assert_eq!(stats.token_segs, 2);
    assert_eq!(stats.sentence_segs, 1);
}

/// Test the tab-separated index serialization through actual files.
#[test]
fn test_text_index_file_round_trip() {
    let dir = TempDir::new().expect("temp dir creation should succeed");
    let cx_path = dir.path().join("doc.cx");

    let (cx, _, _) = index_in_memory(SOURCE, &IndexerConfig::default());
    let mut buf = Vec::new();
    let count = cx
        .write(&mut buf, CxFormat::Text)
        .expect("text serialization should succeed");
    assert_eq!(count, 3);
    std::fs::write(&cx_path, &buf).expect("index write should succeed");

    let bytes = std::fs::read(&cx_path).expect("index read should succeed");
    let content = String::from_utf8(bytes.clone()).expect("text index should be UTF-8");
    assert!(content.starts_with("%%"));
    assert!(content.trim_end().ends_with("%% records=3"));

    let loaded = CharIndex::read(cx_path.to_str().expect("path should be UTF-8"), &bytes)
        .expect("index load should succeed");
    assert_eq!(loaded.records(), cx.records());
}

/// Test the standoff rewrite of tokenizer output.
#[test]
fn test_standoff_output() {
    let mut out = Vec::new();
    let base = default_xml_base("doc.t.xml");
    assert_eq!(base, "doc.xml");
    let stats = standoff_tokens(TOKENS.as_bytes(), "doc.t.xml", &base, &mut out)
        .expect("standoff rewrite should succeed");
    let out = String::from_utf8(out).expect("standoff output should be UTF-8");
    assert!(out.contains(r#"<tokens xml:base="doc.xml">"#));
    assert!(out.contains(r##"<w xml:id="w1" t="Hi"><c ref="#c1"/><c ref="#c2"/></w>"##));
    assert_eq!(stats.tokens, 1);
    assert_eq!(stats.refs, 2);
}

/// Test that every stage is a pure function of its input bytes.
#[test]
fn test_pipeline_determinism() {
    let run = || {
        let (cx, sx, tx) = index_in_memory(SOURCE, &IndexerConfig::default());
        let text_index = OffsetIndex::over_text(&cx);
        let bx = BlockIndex::whole_stream(cx.text_len());
        let txt_index = OffsetIndex::over_tokenizer(&bx, &text_index);
        let data = TokenData::load("doc.t.xml", TOKENS.as_bytes(), &cx, &txt_index)
            .expect("token load should succeed");
        let mut merged = Vec::new();
        merge_document(
            SOURCE.as_bytes(),
            "doc.xml",
            &cx,
            &data,
            &MergeFormat::default(),
            &mut merged,
        )
        .expect("merge should succeed");
        (sx, tx, merged)
    };
    assert_eq!(run(), run());
}
