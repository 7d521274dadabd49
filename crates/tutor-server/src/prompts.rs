//! System prompts sent to the chat model.
//!
//! Every route pairs one fixed system prompt with the user's input. Most
//! prompts embed a [`Level`] fragment that sets the tone of the `message`
//! shown to the child, and the shared Blockly XML primer.

use serde::{Deserialize, Serialize};

/// Learner level chosen in the editor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Young children: kana only, explained through analogies.
    #[default]
    Beginner,
    /// Concrete, educational explanations.
    Intermediate,
    /// Technical explanations.
    Advanced,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Beginner => write!(f, "beginner"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Advanced => write!(f, "advanced"),
        }
    }
}

impl Level {
    /// Returns the tone instruction for this level.
    #[must_use]
    pub const fn fragment(self) -> &'static str {
        match self {
            Self::Beginner => BEGINNER_FRAGMENT,
            Self::Intermediate => INTERMEDIATE_FRAGMENT,
            Self::Advanced => ADVANCED_FRAGMENT,
        }
    }
}

const BEGINNER_FRAGMENT: &str = "初心者向けにmessageには基本的にひらがなとカタカナのみを使用し、複雑な説明は避け、なにかの物事に例えながら教育的になるようにレスポンスしてください。";

const INTERMEDIATE_FRAGMENT: &str =
    "中級者向けに、教育になるように、具体的に分かりやすくレスポンスしてください。";

const ADVANCED_FRAGMENT: &str = "上級者向けに、専門的に分かりやすくレスポンスしてください。";

/// Description of the Blockly XML format and the blocks the editor offers.
pub const BLOCKLY_PRIMER: &str = r#"Blocklyは、Googleが開発したビジュアルプログラミングエディタとして広く使用されています。Blocklyのプログラムは、XML形式で保存および読み込みが可能です。以下は、BlocklyのXMLの基本的な構造とその要素についての説明です。

以下に仕様を記載します。次回のメッセージから以下のルールに則って入力を元に完全で完璧なXMLを作ってください。

<xml> タグ: すべてのBlockly XMLドキュメントは、<xml>タグで始まり、</xml>タグで終わります。

<block> タグ: 各ブロックは<block>タグで表されます。このタグには、ブロックの種類を示す"type"属性が含まれます。
例: <block type="controls_if"></block>

<field> タグ: ブロック内のフィールド（テキストボックスやドロップダウンメニューなど）は<field>タグで表されます。このタグには、フィールドの名前を示す"name"属性が含まれます。
例: <field name="TIMES">10</field>

<value> タグ: 他のブロックを入力として接続する場合、<value>タグを使用します。このタグには、入力の名前を示す"name"属性が含まれます。
例: <value name="DO">...</value>

<statement> タグ: 他のブロックをステートメントとして接続する場合、<statement>タグを使用します。このタグには、ステートメントの名前を示す"name"属性が含まれます。
例: <statement name="DO">...</statement>

<next> タグ: 連続するブロックを接続する場合、<next>タグを使用します。
例: <next>...</next>

<shadow> タグ: シャドウブロック（デフォルトのブロック）を示すために使用されます。

<mutation> タグ: ブロックの特定の変更や構成を保存するために使用されます。

使用可能なブロック:

Logic: controls_if、logic_compare、logic_operation、logic_negate、logic_boolean、logic_ternary

Loops: controls_repeat、controls_whileUntil、controls_forEach

Text: text_charAt、text_print、text、text_length、text_prompt_ext

Math: math_number、math_arithmetic、math_single

Values: math_number、text"#;

const PATCH_EXAMPLE: &str = r#"user: "実行の中に、forループで5回プリントしたい！\n顧客が入力したXML\n\n<block xmlns=\"https://developers.google.com/blockly/xml\" type=\"controls_ifelse\" id=\"D#nk9m54@pme_(uQY9Cj\"/>"
assistant:

{"xml": "<xml xmlns=\"https://developers.google.com/blockly/xml\"><block type=\"controls_ifelse\" id=\"D#nk9m54@pme_(uQY9Cj\"><value name=\"IF0\"><block type=\"logic_boolean\"><field name=\"BOOL\">TRUE</field></block></value><statement name=\"DO0\"><block type=\"controls_repeat_ext\"><value name=\"TIMES\"><shadow type=\"math_number\"><field name=\"NUM\">5</field></shadow></value><statement name=\"DO\"><block type=\"text_print\"><value name=\"TEXT\"><shadow type=\"text\"><field name=\"TEXT\">Hello, World!</field></shadow></value></block></statement></block></statement></block></xml>", "message": "「じっこう」のなかに「5かいくりかえす」ブロックをいれたよ。"}"#;

/// Heading under which the current block document is appended to a patch request.
pub const CURRENT_XML_HEADING: &str = "顧客が入力したXML";

/// Question sent alongside the workspace snapshot on `/blockly-insight`.
pub const INSIGHT_QUESTION: &str = "このBlocklyブロックは何を行っているか説明してください。";

/// System prompt for `POST /build-block`.
#[must_use]
pub fn build(level: Level) -> String {
    format!(
        "あなたは、顧客である子どもたちのために、受け取った入力から、BlocklyのXMLを一切省略せずに生成するアシスタントです。

jsonとして生成してほしいのは2つです。xmlフィールドでXMLを必ずレスポンスしてください。JavaScriptなどの実際のコードは不要です。
また、その生成されたXMLを元に、messageフィールドでなぜそのブロックを使用する必要があるのかを子どもの教育のために説明してください。これは実際に子どもたちのために表示されるので注意してください。XML上のブロック名ではなく、日本語でのブロック名を使用してください。

顧客のレベル: {}

{BLOCKLY_PRIMER}
",
        level.fragment()
    )
}

/// System prompt for `PATCH /build-block`.
#[must_use]
pub fn patch(level: Level) -> String {
    format!(
        "あなたは、顧客である子どもたちのために、受け取ったBlocklyのXML入力から、要望を元に、既存のXMLに変更を加える形で修正したBlocklyのXMLだけを返信するアシスタントです。JSONのxmlフィールドには、既存のXMLに変更を加えたものだけを返信してください。JSONのmessageフィールドには、なぜこの変更を加えたのかの解説も入れてください。

顧客のレベル: {}

例：

{PATCH_EXAMPLE}

{BLOCKLY_PRIMER}
",
        level.fragment()
    )
}

/// System prompt for `POST /block-fix`.
#[must_use]
pub fn fix() -> String {
    format!(
        "あなたは、顧客である子どもたちのために、受け取ったBlocklyのXMLとエラーメッセージから既存のXMLに変更を加える形で自律的に修正したBlocklyのXMLだけをJSONのxmlフィールドで返信するアシスタントです。JSONのmessageフィールドにはエラーを発生させて申し訳なかったことを謝罪し、なぜこのエラーが発生したのかの解説も入れてください。

{BLOCKLY_PRIMER}
"
    )
}

/// System prompt for `POST /blockly-insight`.
#[must_use]
pub fn insight(level: Level) -> String {
    format!(
        "あなたは子どもたちのために、質問されたBlocklyの画像とXMLをもとに、ブロックでどのような処理が行われているかを解説するアシスタントです。分かりやすく、簡潔に、子どもたちが理解できるように説明してください。

顧客のレベル: {}",
        level.fragment()
    )
}

/// System prompt for `POST /ask`.
#[must_use]
pub fn ask(level: Level) -> String {
    format!(
        "あなたは、Blocklyでプログラミングを学ぶ子どもたちの質問に答えるアシスタントです。プログラミングやブロックの使い方についての質問に、間違いのないように、短く丁寧に答えてください。プログラミングと関係のない質問には、やさしく話題をプログラミングに戻してください。

顧客のレベル: {}",
        level.fragment()
    )
}

/// System prompt for `POST /code-block`.
#[must_use]
pub fn code() -> String {
    format!(
        "あなたは、子どもたちのために、受け取った入力から、BlocklyのXMLを生成するアシスタントです。コードブロックのみを必ず省略せず絶対にレスポンスしてください。JavaScriptなどの実際のコードは不要です。前後のコードの説明などのメッセージは不要です。Markdownのコードブロックだけをレスポンスするのがあなたの仕事です。

{BLOCKLY_PRIMER}"
    )
}

/// User message for a patch request, with the current document appended when present.
#[must_use]
pub fn patch_user_message(prompt: &str, xml: Option<&str>) -> String {
    match xml.map(str::trim).filter(|xml| !xml.is_empty()) {
        Some(xml) => format!("{prompt}\n{CURRENT_XML_HEADING}\n\n{xml}"),
        None => prompt.to_string(),
    }
}

/// User message for a fix request.
#[must_use]
pub fn fix_user_message(error: &str, xml: &str) -> String {
    format!("エラーメッセージ:\n{error}\n\n{CURRENT_XML_HEADING}\n\n{xml}")
}

/// Text part of an insight request.
#[must_use]
pub fn insight_user_text(xml: &str) -> String {
    format!("{INSIGHT_QUESTION}\n\n```xml\n{xml}\n```")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Level::Beginner).unwrap(), r#""beginner""#);
        assert_eq!(
            serde_json::to_string(&Level::Intermediate).unwrap(),
            r#""intermediate""#
        );
        assert_eq!(serde_json::to_string(&Level::Advanced).unwrap(), r#""advanced""#);
    }

    #[test]
    fn level_rejects_unknown_literals() {
        assert!(serde_json::from_str::<Level>(r#""expert""#).is_err());
        assert!(serde_json::from_str::<Level>(r#""Beginner""#).is_err());
    }

    #[test]
    fn level_display_matches_wire_format() {
        for level in [Level::Beginner, Level::Intermediate, Level::Advanced] {
            let wire = serde_json::to_string(&level).unwrap();
            assert_eq!(wire.trim_matches('"'), level.to_string());
        }
    }

    #[test]
    fn build_prompt_embeds_level_and_primer() {
        let prompt = build(Level::Advanced);
        assert!(prompt.contains(ADVANCED_FRAGMENT));
        assert!(!prompt.contains(BEGINNER_FRAGMENT));
        assert!(prompt.contains("xmlフィールド"));
        assert!(prompt.contains("messageフィールド"));
        assert!(prompt.contains(BLOCKLY_PRIMER));
    }

    #[test]
    fn patch_prompt_contains_example() {
        let prompt = patch(Level::Intermediate);
        assert!(prompt.contains(INTERMEDIATE_FRAGMENT));
        assert!(prompt.contains("controls_repeat_ext"));
        assert!(prompt.contains(BLOCKLY_PRIMER));
    }

    #[test]
    fn fix_prompt_asks_for_apology() {
        let prompt = fix();
        assert!(prompt.contains("謝罪"));
        assert!(prompt.contains(BLOCKLY_PRIMER));
    }

    #[test]
    fn insight_and_ask_use_level() {
        assert!(insight(Level::Beginner).contains(BEGINNER_FRAGMENT));
        assert!(ask(Level::Intermediate).contains(INTERMEDIATE_FRAGMENT));
    }

    #[test]
    fn code_prompt_requests_markdown_block() {
        assert!(code().contains("Markdownのコードブロック"));
    }

    #[test]
    fn patch_user_message_appends_current_xml() {
        assert_eq!(patch_user_message("もっと", None), "もっと");
        assert_eq!(patch_user_message("もっと", Some("  ")), "もっと");

        let message = patch_user_message("5かい", Some("<xml/>"));
        assert_eq!(message, "5かい\n顧客が入力したXML\n\n<xml/>");
    }

    #[test]
    fn fix_and_insight_messages_include_inputs() {
        let message = fix_user_message("Unexpected token", "<xml></xml>");
        assert!(message.contains("Unexpected token"));
        assert!(message.contains("<xml></xml>"));

        let text = insight_user_text("<xml id=\"a\"/>");
        assert!(text.starts_with(INSIGHT_QUESTION));
        assert!(text.contains("```xml\n<xml id=\"a\"/>\n```"));
    }
}
